// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GOP structures and the reordering depth each one implies.

use crate::codec::vui::ReorderHint;

/// Largest custom GOP the firmware accepts.
pub const MAX_CUSTOM_GOP_SIZE: usize = 8;

/// DTS offset used whenever the reordering depth is not known up front.
pub const DEFAULT_DTS_OFFSET: u32 = 7;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GopPicType {
    #[default]
    I,
    P,
    B,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GopPicture {
    pub pic_type: GopPicType,
    pub poc_offset: i32,
    pub pic_qp: i32,
    pub num_ref_pic_l0: u32,
    pub ref_poc_l0: i32,
    pub ref_poc_l1: i32,
    pub temporal_id: u32,
}

/// A user described GOP, in decode order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomGop {
    pub size: usize,
    pub pictures: [GopPicture; MAX_CUSTOM_GOP_SIZE],
}

impl CustomGop {
    pub fn pictures(&self) -> &[GopPicture] {
        &self.pictures[..self.size.min(MAX_CUSTOM_GOP_SIZE)]
    }

    /// Largest number of pictures decoded ahead of a picture that precedes
    /// them in output order.
    pub fn num_reorder(&self) -> u32 {
        let pics = self.pictures();
        pics.iter()
            .enumerate()
            .map(|(i, pic)| {
                pics[..i]
                    .iter()
                    .filter(|prev| prev.poc_offset > pic.poc_offset)
                    .count() as u32
            })
            .max()
            .unwrap_or(0)
    }

    pub fn num_ref_frames(&self) -> u32 {
        self.pictures()
            .iter()
            .map(|pic| pic.num_ref_pic_l0 + u32::from(pic.pic_type == GopPicType::B))
            .max()
            .unwrap_or(0)
    }
}

/// Firmware GOP presets. Index 0 selects the custom GOP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GopPreset {
    Custom,
    IntraOnly,
    Ipp,
    LowDelayB,
    Ibpbp,
    Ibbbp,
    IppMultiRef,
    LowDelayBMultiRef,
    RandomAccess,
    IpLowDelay,
}

impl GopPreset {
    pub fn from_index(index: i32) -> Option<Self> {
        Some(match index {
            0 => GopPreset::Custom,
            1 => GopPreset::IntraOnly,
            2 => GopPreset::Ipp,
            3 => GopPreset::LowDelayB,
            4 => GopPreset::Ibpbp,
            5 => GopPreset::Ibbbp,
            6 => GopPreset::IppMultiRef,
            7 => GopPreset::LowDelayBMultiRef,
            8 => GopPreset::RandomAccess,
            9 => GopPreset::IpLowDelay,
            _ => return None,
        })
    }

    /// Pictures per GOP, `None` for the custom GOP.
    pub fn gop_size(&self) -> Option<u32> {
        match self {
            GopPreset::Custom => None,
            GopPreset::Ibpbp => Some(2),
            GopPreset::Ibbbp => Some(4),
            GopPreset::RandomAccess => Some(8),
            _ => Some(1),
        }
    }

    /// Number of packets whose DTS has to be synthesized before the first
    /// input PTS can be used as a DTS.
    pub fn dts_offset(&self) -> u32 {
        match self {
            GopPreset::IntraOnly
            | GopPreset::Ipp
            | GopPreset::LowDelayB
            | GopPreset::IppMultiRef
            | GopPreset::LowDelayBMultiRef
            | GopPreset::IpLowDelay => 0,
            GopPreset::Ibpbp => 1,
            GopPreset::Ibbbp => 2,
            GopPreset::RandomAccess => 3,
            GopPreset::Custom => DEFAULT_DTS_OFFSET,
        }
    }

    pub fn reorder_hint(&self, custom: Option<&CustomGop>) -> ReorderHint {
        let (max_num_reorder_frames, num_ref_frames) = match self {
            GopPreset::IntraOnly => (0, 0),
            GopPreset::Ipp | GopPreset::IpLowDelay => (0, 1),
            GopPreset::LowDelayB => (0, 2),
            GopPreset::IppMultiRef | GopPreset::LowDelayBMultiRef => (0, 4),
            GopPreset::Ibpbp => (1, 2),
            GopPreset::Ibbbp => (2, 3),
            GopPreset::RandomAccess => (3, 4),
            GopPreset::Custom => custom
                .map(|gop| (gop.num_reorder(), gop.num_ref_frames()))
                .unwrap_or((0, 1)),
        };

        ReorderHint {
            max_num_reorder_frames,
            num_ref_frames,
        }
    }
}

/// DTS offset for a GOP preset index. Forcing frame types makes the output
/// order unpredictable, so it always gets the default offset.
pub fn dts_offset(gop_preset_index: i32, force_frame_type: bool) -> u32 {
    if force_frame_type {
        return DEFAULT_DTS_OFFSET;
    }

    GopPreset::from_index(gop_preset_index)
        .map(|preset| preset.dts_offset())
        .unwrap_or(DEFAULT_DTS_OFFSET)
}
