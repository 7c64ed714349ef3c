// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode side of the adapter.
//!
//! [`xcoder::XcoderDecoder`] drives a [`crate::backend::DecoderSession`]:
//! compressed packets go in through `submit`, decoded pictures come out of
//! `receive` as [`DecodedFrame`]s whose planes stay on loan from the output
//! buffer pool until dropped.

pub mod header_cache;
pub mod xcoder;

use thiserror::Error;

use crate::backend::DeviceError;
use crate::codec::sei::SeiError;
use crate::config::ConfigError;
use crate::frame_pool::PooledBuffer;
use crate::PictureType;
use crate::PixelFormat;
use crate::Resolution;

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no data available, try again")]
    TryAgain,
    #[error("end of stream")]
    EndOfStream,
    #[error("decoder is flushing, release output frames before sending more input")]
    Busy,
    #[error("VPU recovery required, the decoder must be reset")]
    RecoveryRequired,
    #[error("decoded frame of {size} bytes is too small for {resolution}")]
    TruncatedFrame { size: usize, resolution: Resolution },
    #[error("invalid decoder state transition {from:?} -> {to:?}")]
    InvalidState {
        from: DecoderState,
        to: DecoderState,
    },
    #[error("packet pts={submitted:?} submitted while pts={pending:?} is still pending")]
    PacketPending {
        pending: Option<i64>,
        submitted: Option<i64>,
    },
    #[error(transparent)]
    CorruptSei(#[from] SeiError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle of a decode session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    /// Nothing written to the current session yet.
    Idle,
    Started,
    /// End of stream sent, pictures still coming.
    Draining,
    /// The device reported the last picture.
    Eos,
    /// Every output buffer is held by the caller.
    Flushing,
}

impl DecoderState {
    pub fn can_transition_to(self, to: DecoderState) -> bool {
        use DecoderState::*;

        matches!(
            (self, to),
            (Idle, Started)
                | (Started, Draining)
                | (Draining, Eos)
                | (Idle | Started | Draining, Flushing)
                | (Flushing, Idle | Started | Draining)
                | (Draining | Eos, Started)
                | (Started | Draining | Eos | Flushing, Idle)
        )
    }
}

/// What became of a submitted packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The device took this many bytes and the packet is done.
    Sent(usize),
    /// The packet was kept to go out with a later one.
    Buffered(usize),
    /// The device took part of the packet. Submit the same packet again to
    /// send the rest.
    Partial { sent: usize, remaining: usize },
    /// End of stream signalled.
    Drained,
}

/// Rows and columns to crop from each edge.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Crop {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

/// A decoded I420 picture.
#[derive(Debug)]
pub struct DecodedFrame {
    pub buffer: PooledBuffer,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub offsets: [usize; 3],
    pub strides: [usize; 3],
    pub picture_type: PictureType,
    pub key_frame: bool,
    pub crop: Crop,
    pub pts: i64,
    pub pkt_dts: Option<i64>,
    pub pkt_pos: Option<u64>,
    pub pkt_duration: i64,
    /// ATSC A/53 closed caption bytes.
    pub closed_caption: Option<Vec<u8>>,
    /// User data unregistered SEI payloads.
    pub user_data_sei: Vec<Vec<u8>>,
}

impl DecodedFrame {
    pub fn plane(&self, index: usize) -> &[u8] {
        let height = self.resolution.height as usize;
        let rows = if index == 0 { height } else { height / 2 };
        let start = self.offsets[index];
        let end = (start + rows * self.strides[index]).min(self.buffer.len());
        self.buffer.get(start..end).unwrap_or(&[])
    }
}

/// Offsets and strides of an I420 picture packed without padding.
pub(crate) fn i420_layout(resolution: Resolution, bit_depth_factor: u32) -> ([usize; 3], [usize; 3], usize) {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    let bdf = bit_depth_factor as usize;

    let luma_stride = w * bdf;
    let chroma_stride = w / 2 * bdf;
    let luma = luma_stride * h;
    let chroma = chroma_stride * (h / 2);

    (
        [0, luma, luma + chroma],
        [luma_stride, chroma_stride, chroma_stride],
        luma + 2 * chroma,
    )
}
