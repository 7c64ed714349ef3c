// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode side of the adapter.
//!
//! [`xcoder::XcoderEncoder`] drives a [`crate::backend::EncoderSession`]: raw
//! frames go in through `send_frame`, compressed packets come out of
//! `receive_packet`. Frames the device cannot take yet wait in a
//! [`frame_queue::FrameQueue`], and a resolution change drains the running
//! session before a new one is opened for the queued frames.

pub mod frame_queue;
pub mod layout;
pub mod reconfig;
pub mod reorder;
pub mod roi;
pub mod seq_change;
#[cfg(feature = "threaded-write")]
pub mod threaded;
pub mod trailer;
pub mod xcoder;

use bytes::Bytes;
use thiserror::Error;

use crate::backend::DeviceError;
use crate::codec::nalu_writer::NaluWriterError;
use crate::codec::sei::SeiError;
use crate::config::ConfigError;
use crate::encoder::seq_change::SeqChangeState;
use crate::ColorDescription;
use crate::PictureType;
use crate::PixelFormat;
use crate::Resolution;

pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no data available, try again")]
    TryAgain,
    #[error("end of stream")]
    EndOfStream,
    #[error("invalid encoder state transition {from:?} -> {to:?}")]
    InvalidState {
        from: EncoderState,
        to: EncoderState,
    },
    #[error("invalid sequence change transition {from:?} -> {to:?}")]
    InvalidSeqChange {
        from: SeqChangeState,
        to: SeqChangeState,
    },
    #[error("frame buffer of {size} bytes is too small for {resolution}")]
    FrameTooSmall { size: usize, resolution: Resolution },
    #[error(transparent)]
    Sei(#[from] SeiError),
    #[error("failed to build VUI: {0}")]
    Vui(#[from] NaluWriterError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Lifecycle of an encode session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncoderState {
    /// No frame written to the current session yet.
    Idle,
    Started,
    /// End of stream written, packets still coming.
    Flushing,
    /// End of stream written because the input changed resolution.
    SequenceChangeDraining,
    /// The device returned the last packet.
    Eos,
}

impl EncoderState {
    pub fn can_transition_to(self, to: EncoderState) -> bool {
        use EncoderState::*;

        matches!(
            (self, to),
            (Idle, Started | Eos)
                | (Started, Flushing | SequenceChangeDraining)
                | (Flushing, Eos)
                | (SequenceChangeDraining | Started | Flushing | Eos, Idle)
        )
    }
}

/// What became of a sent frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// The device took the frame.
    Sent,
    /// The frame waits in the queue and goes out with a later call.
    Queued,
    /// End of stream has been signalled.
    EndOfStream,
}

/// Long-term reference control for one frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LongTermRef {
    /// Keep this picture as a long-term reference.
    pub use_cur_src_as_long_term_pic: u8,
    /// Predict this picture from the long-term reference.
    pub use_long_term_ref: u8,
}

/// An I420 picture to encode, with its side data.
#[derive(Clone, Debug, Default)]
pub struct RawFrame {
    pub planes: [Bytes; 3],
    /// Bytes per row of each plane.
    pub strides: [usize; 3],
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub color: ColorDescription,
    pub pts: i64,
    /// Requested coding type, [`PictureType::None`] to let the encoder pick.
    pub picture_type: PictureType,
    /// ATSC A/53 `cc_data` triplets.
    pub closed_caption: Option<Vec<u8>>,
    /// User data unregistered SEI payload, UUID included.
    pub user_data_sei: Option<Vec<u8>>,
    pub long_term_ref: Option<LongTermRef>,
    /// New target bitrate taking effect with this frame.
    pub target_bitrate: Option<i32>,
}

impl RawFrame {
    /// Wraps a packed I420 buffer. The planes share `data`.
    pub fn from_i420(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        pts: i64,
    ) -> EncodeResult<Self> {
        let bdf = format.bit_depth_factor() as usize;
        let luma_stride = resolution.width as usize * bdf;
        let chroma_stride = resolution.width as usize / 2 * bdf;
        let luma = luma_stride * resolution.height as usize;
        let chroma = chroma_stride * (resolution.height as usize / 2);

        if data.len() < luma + 2 * chroma {
            return Err(EncodeError::FrameTooSmall {
                size: data.len(),
                resolution,
            });
        }

        Ok(Self {
            planes: [
                data.slice(..luma),
                data.slice(luma..luma + chroma),
                data.slice(luma + chroma..luma + 2 * chroma),
            ],
            strides: [luma_stride, chroma_stride, chroma_stride],
            resolution,
            format,
            pts,
            ..Default::default()
        })
    }

    /// Height in rows of plane `index`.
    pub fn plane_height(&self, index: usize) -> usize {
        let height = self.resolution.height as usize;
        if index == 0 {
            height
        } else {
            height / 2
        }
    }
}
