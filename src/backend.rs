// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware SDK seen from the adapters.
//!
//! A backend owns one accelerator session, opened and closed explicitly and
//! never shared. The adapters in [`crate::decoder`] and [`crate::encoder`] are
//! generic over these traits, so the session protocol can be driven by the real
//! SDK bindings or by the scripted [`dummy`] sessions used in tests.

pub mod dummy;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::vui::VuiRbsp;
use crate::config::DeviceSelector;
use crate::config::EncoderParams;
use crate::Codec;
use crate::PictureType;
use crate::Resolution;

/// Largest single transfer the device accepts.
pub const MAX_TRANSFER_SIZE: u32 = 0xA0_0000;
/// Transfer size assumed when the SDK reports none.
pub const DEFAULT_IO_SIZE: u32 = 128 * 1024;
/// Metadata prefixed by the encoder to every frame it receives.
pub const FRAME_METADATA_SIZE: usize = 64;
/// Metadata prefixed by the encoder to every packet it returns.
pub const PACKET_METADATA_SIZE: usize = 64;

/// Typed outcomes of the SDK. Raw return codes stop here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no device or core available")]
    ResourceUnavailable,
    #[error("device write buffer full")]
    WriteBufferFull,
    #[error("VPU recovery required")]
    VpuRecovery,
    #[error("session is no longer valid")]
    InvalidSession,
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("device failure (status {0})")]
    Failure(i32),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Decoder,
    Encoder,
}

/// Whether a read may wait for the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    #[default]
    NonBlocking,
}

/// Everything a session needs to be opened.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub device_type: DeviceType,
    pub selector: DeviceSelector,
    pub hw_index: i32,
    pub codec: Codec,
    pub resolution: Resolution,
    pub conf_win_right: u32,
    pub conf_win_bottom: u32,
    pub bit_depth_factor: u32,
    pub io_size: Option<u32>,
    pub vui: Option<VuiRbsp>,
    pub hdr_vui: bool,
    pub zero_copy: bool,
    pub encoder_params: Option<EncoderParams>,
}

impl SessionConfig {
    pub fn new(device_type: DeviceType, codec: Codec, resolution: Resolution) -> Self {
        Self {
            device_type,
            selector: DeviceSelector::default(),
            hw_index: -1,
            codec,
            resolution,
            conf_win_right: 0,
            conf_win_bottom: 0,
            bit_depth_factor: 1,
            io_size: None,
            vui: None,
            hdr_vui: false,
            zero_copy: false,
            encoder_params: None,
        }
    }
}

/// What the SDK reports back from a successful open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u32,
    pub device_name: String,
    pub block_name: String,
    pub hw_index: i32,
    /// Zero when the SDK does not report one.
    pub max_io_size: u32,
    pub zero_copy_supported: bool,
    /// The decoder takes input in 512 byte units.
    pub packet_512_aligned: bool,
}

impl SessionInfo {
    pub fn io_size(&self) -> u32 {
        if self.max_io_size == 0 {
            DEFAULT_IO_SIZE
        } else {
            self.max_io_size
        }
    }
}

/// Calls common to decode and encode sessions.
pub trait XcoderSession {
    fn open(&mut self, config: &SessionConfig) -> DeviceResult<SessionInfo>;

    /// Closes the session. `eos` tells the device whether the stream ended
    /// cleanly.
    fn close(&mut self, eos: bool) -> DeviceResult<()>;

    fn flush(&mut self) -> DeviceResult<()>;
}

/// One compressed write to a decode session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketWrite {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub pos: u64,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    /// User data unregistered payload to hand back with the decoded picture.
    pub user_data_sei: Option<Vec<u8>>,
}

/// A decoded picture as filled in by the device.
#[derive(Clone, Debug, Default)]
pub struct FrameRead {
    /// Output buffer, sized by the caller for the expected picture.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per sample, 0 when not reported.
    pub bit_depth_factor: u32,
    pub crop_top: u32,
    pub crop_bottom: u32,
    pub crop_left: u32,
    pub crop_right: u32,
    pub picture_type: PictureType,
    pub pts: Option<i64>,
    pub end_of_stream: bool,
    /// Closed caption bytes inside `data`, as (offset, len).
    pub closed_caption_at: Option<(usize, usize)>,
    /// User data unregistered SEI inside `data`, as (offset, len).
    pub user_data_sei_at: Option<(usize, usize)>,
    /// User data unregistered payload carried over from the packet.
    pub user_data_sei: Option<Vec<u8>>,
}

pub trait DecoderSession: XcoderSession {
    /// Returns how many bytes of `packet` were accepted. `Ok(0)` means none.
    fn write_packet(&mut self, packet: &PacketWrite) -> DeviceResult<usize>;

    /// Returns the size of the decoded picture. `Ok(0)` means no picture yet.
    fn read_frame(&mut self, frame: &mut FrameRead, mode: BlockingMode) -> DeviceResult<usize>;
}

/// Plane storage handed to the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FramePlanes {
    /// The caller's planes, passed through untouched.
    ZeroCopy([Bytes; 3]),
    /// One contiguous buffer laid out in the hardware strides.
    Copied { data: Vec<u8>, offsets: [usize; 3] },
}

impl Default for FramePlanes {
    fn default() -> Self {
        FramePlanes::Copied {
            data: Vec::new(),
            offsets: [0; 3],
        }
    }
}

/// Sizes of the segments of [`FrameWrite::extra_data`], in the order they
/// appear.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtraDataLayout {
    /// Change parameters block, also present when only ROI or SEI follow.
    pub reconf_len: usize,
    pub roi_len: usize,
    /// Average QP of the ROI map.
    pub roi_avg_qp: u32,
    pub sei_cc_len: usize,
    pub preferred_characteristics_len: usize,
    pub udu_sei_len: usize,
}

impl ExtraDataLayout {
    pub fn sei_total_len(&self) -> usize {
        self.sei_cc_len + self.preferred_characteristics_len + self.udu_sei_len
    }

    pub fn total_len(&self) -> usize {
        self.reconf_len + self.roi_len + self.sei_total_len()
    }
}

/// One raw frame write to an encode session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameWrite {
    pub planes: FramePlanes,
    pub strides: [u32; 3],
    pub resolution: Resolution,
    /// Auxiliary data appended after the planes and the frame metadata.
    pub extra_data: Vec<u8>,
    pub extra_layout: ExtraDataLayout,
    pub pts: i64,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    pub force_key_frame: bool,
    pub picture_type: PictureType,
    pub force_pic_qp: Option<i32>,
    pub use_cur_src_as_long_term_pic: u8,
    pub use_long_term_ref: u8,
    /// Transfer size to use for this frame, if capped.
    pub io_size: Option<u32>,
}

/// One coded unit read from an encode session.
#[derive(Clone, Debug, Default)]
pub struct PacketRead {
    /// Payload including the [`PACKET_METADATA_SIZE`] prefix.
    pub data: Vec<u8>,
    /// 0 for intra pictures.
    pub frame_type: u32,
    pub pts: i64,
    pub end_of_stream: bool,
}

pub trait EncoderSession: XcoderSession {
    /// Returns the bytes accepted. `Ok(0)` means the frame was not taken.
    fn write_frame(&mut self, frame: &FrameWrite) -> DeviceResult<usize>;

    /// Returns the bytes read including metadata. `Ok(0)` means no packet yet.
    fn read_packet(&mut self, packet: &mut PacketRead) -> DeviceResult<usize>;
}
