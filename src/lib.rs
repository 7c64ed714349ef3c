// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session adapters for NetInt XCoder transcoding accelerators.
//!
//! The hardware SDK is reached through the traits in [`backend`]. On top of
//! it, [`decoder::xcoder::XcoderDecoder`] and [`encoder::xcoder::XcoderEncoder`]
//! turn the accelerator's buffered, backpressured session protocol into a
//! send/receive API, and [`codec`] holds the bitstream level helpers both
//! sides need to place headers and SEI payloads.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod frame_pool;

use std::fmt;
use std::str::FromStr;

use enumn::N;

/// Smallest picture the hardware encodes. Smaller input is padded up to it.
pub const MIN_WIDTH: u32 = 256;
pub const MIN_HEIGHT: u32 = 128;
pub const MAX_WIDTH: u32 = 8192;
pub const MAX_HEIGHT: u32 = 8192;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Codec families the accelerator handles. They differ in NAL header layout
/// and in the alignment the encoder pads pictures to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Pixel alignment of the coded picture size.
    pub fn alignment(&self) -> u32 {
        match self {
            Codec::H264 => 16,
            Codec::H265 => 8,
        }
    }
}

impl FromStr for Codec {
    type Err = codec::nalu::NaluError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" => Ok(Codec::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(Codec::H265),
            _ => {
                log::error!("unsupported codec {}", s);
                Err(codec::nalu::NaluError::UnsupportedCodec(s.to_string()))
            }
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::H265 => write!(f, "h265"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    I420,
    I420P10Le,
}

impl PixelFormat {
    /// Bytes per sample.
    pub fn bit_depth_factor(&self) -> u32 {
        match self {
            PixelFormat::I420 => 1,
            PixelFormat::I420P10Le => 2,
        }
    }

    pub fn from_bit_depth_factor(factor: u32) -> Self {
        if factor == 2 {
            PixelFormat::I420P10Le
        } else {
            PixelFormat::I420
        }
    }
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i420" | "I420" | "yuv420p" => Ok(PixelFormat::I420),
            "i420p10le" | "yuv420p10le" => Ok(PixelFormat::I420P10Le),
            _ => Err("unrecognized pixel format. Valid values: yuv420p, yuv420p10le"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

/// ITU-T H.273 colour primaries.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470Bg = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    Film = 8,
    Bt2020 = 9,
    Smpte428 = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

/// ITU-T H.273 transfer characteristics.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TransferCharacteristic {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Gamma22 = 4,
    Gamma28 = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    Linear = 8,
    Log = 9,
    LogSqrt = 10,
    Iec61966_2_4 = 11,
    Bt1361Ecg = 12,
    Iec61966_2_1 = 13,
    Bt2020_10 = 14,
    Bt2020_12 = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    AribStdB67 = 18,
}

/// ITU-T H.273 matrix coefficients.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorSpace {
    Rgb = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Fcc = 4,
    Bt470Bg = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    YCgCo = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    Ictcp = 14,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorDescription {
    pub primaries: ColorPrimaries,
    pub transfer: TransferCharacteristic,
    pub space: ColorSpace,
}

impl ColorDescription {
    /// HDR-class content: BT.2020 primaries or matrix, or a PQ/HLG transfer.
    pub fn is_hdr(&self) -> bool {
        self.primaries == ColorPrimaries::Bt2020
            || matches!(
                self.transfer,
                TransferCharacteristic::Smpte2084 | TransferCharacteristic::AribStdB67
            )
            || matches!(self.space, ColorSpace::Bt2020Ncl | ColorSpace::Bt2020Cl)
    }

    /// Takes each field from `forced` unless it is unspecified there.
    pub fn overridden_by(&self, forced: &ColorDescription) -> ColorDescription {
        ColorDescription {
            primaries: if forced.primaries == ColorPrimaries::Unspecified {
                self.primaries
            } else {
                forced.primaries
            },
            transfer: if forced.transfer == TransferCharacteristic::Unspecified {
                self.transfer
            } else {
                forced.transfer
            },
            space: if forced.space == ColorSpace::Unspecified {
                self.space
            } else {
                forced.space
            },
        }
    }
}

/// Coding type of a picture as reported or requested at the adapter boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PictureType {
    #[default]
    None,
    I,
    P,
    B,
    Idr,
}

/// A unit of compressed data. Decoder input, or encoder output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressedPacket {
    /// Annex B byte stream. An empty payload on decoder input asks for the
    /// end of the stream.
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Position of the packet in its container, if known.
    pub pos: Option<u64>,
    pub duration: i64,
    pub key_frame: bool,
    /// Parameter sets produced by the encoder, set on the first packet.
    pub new_extradata: Option<Vec<u8>>,
}

impl CompressedPacket {
    pub fn new(data: Vec<u8>, pts: Option<i64>) -> Self {
        Self {
            data,
            pts,
            ..Default::default()
        }
    }

    /// The empty packet that starts draining a decoder.
    pub fn end_of_stream() -> Self {
        Default::default()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}
