// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VUI RBSP fragment handed to the encoder firmware at session open.

use crate::codec::nalu_writer::NaluWriter;
use crate::codec::nalu_writer::NaluWriterResult;
use crate::Codec;
use crate::ColorDescription;
use crate::Rational;

/// Size of the firmware's VUI buffer.
pub const MAX_VUI_SIZE: usize = 32;

/// `aspect_ratio_idc` value signalling an explicit SAR.
pub const EXTENDED_SAR: u8 = 255;

/// Table E-1 sample aspect ratios, indexed from `aspect_ratio_idc` 1.
const SAR_TABLE: [(u32, u32); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Reordering depth the H.264 bitstream restriction advertises.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReorderHint {
    pub max_num_reorder_frames: u32,
    pub num_ref_frames: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiRbsp {
    pub data: Vec<u8>,
    pub size_bits: usize,
    /// Bit offset of `num_units_in_tick`, patched in by the firmware.
    pub pos_num_units_in_tick: usize,
    /// Bit offset of `time_scale`, patched in by the firmware.
    pub pos_time_scale: usize,
}

impl VuiRbsp {
    pub fn size_bytes(&self) -> usize {
        self.size_bits.div_ceil(8)
    }
}

/// Maps a sample aspect ratio to its `aspect_ratio_idc`. An unset ratio maps
/// to square pixels.
pub fn aspect_ratio_idc(sar: Rational) -> u8 {
    if sar.num == 0 {
        return 1;
    }

    SAR_TABLE
        .iter()
        .position(|&(num, den)| {
            sar.den != 0 && (sar.num as i64) * (den as i64) == (sar.den as i64) * (num as i64)
        })
        .map(|idx| idx as u8 + 1)
        .unwrap_or(EXTENDED_SAR)
}

/// Serializes the VUI syntax the firmware expects: aspect ratio, video signal
/// type with colour description, and timing info with zeroed tick fields. The
/// H.264 variant also carries a bitstream restriction so that decoders can
/// output with minimal delay.
pub fn build_vui(
    codec: Codec,
    sar: Rational,
    color: &ColorDescription,
    reorder: ReorderHint,
) -> NaluWriterResult<VuiRbsp> {
    let mut data = Vec::with_capacity(MAX_VUI_SIZE);
    let (size_bits, pos_num_units_in_tick, pos_time_scale) = {
        let mut w = NaluWriter::new(&mut data, false);

        // aspect_ratio_info_present_flag
        w.write_u(1, true)?;
        let idc = aspect_ratio_idc(sar);
        w.write_u(8, idc)?;
        if idc == EXTENDED_SAR {
            w.write_u(16, sar.num.clamp(0, u16::MAX as i32) as u16)?;
            w.write_u(16, sar.den.clamp(0, u16::MAX as i32) as u16)?;
        }

        // overscan_info_present_flag
        w.write_u(1, false)?;

        // video_signal_type_present_flag, video_format = unspecified,
        // video_full_range_flag, colour_description_present_flag
        w.write_u(1, true)?;
        w.write_u(3, 5u8)?;
        w.write_u(1, false)?;
        w.write_u(1, true)?;
        w.write_u(8, color.primaries as u8)?;
        w.write_u(8, color.transfer as u8)?;
        w.write_u(8, color.space as u8)?;

        // chroma_loc_info_present_flag
        w.write_u(1, false)?;

        if codec == Codec::H265 {
            // neutral_chroma_indication_flag, field_seq_flag,
            // frame_field_info_present_flag, default_display_window_flag
            w.write_u(4, 0u8)?;
        }

        // timing_info_present_flag
        w.write_u(1, true)?;
        let pos_num_units_in_tick = w.bits_written();
        w.write_u(32, 0u32)?;
        let pos_time_scale = w.bits_written();
        w.write_u(32, 0u32)?;

        match codec {
            Codec::H265 => {
                // poc_proportional_to_timing_flag, hrd_parameters_present_flag,
                // bitstream_restriction_flag
                w.write_u(3, 0u8)?;
            }
            Codec::H264 => {
                // fixed_frame_rate_flag
                w.write_u(1, true)?;
                // nal_hrd, vcl_hrd, pic_struct_present_flag
                w.write_u(3, 0u8)?;

                // bitstream_restriction_flag, motion_vectors_over_pic_boundaries_flag
                w.write_u(1, true)?;
                w.write_u(1, true)?;
                w.write_ue(2u32)?; // max_bytes_per_pic_denom
                w.write_ue(1u32)?; // max_bits_per_mb_denom
                w.write_ue(15u32)?; // log2_max_mv_length_horizontal
                w.write_ue(15u32)?; // log2_max_mv_length_vertical
                w.write_ue(reorder.max_num_reorder_frames)?;
                w.write_ue(
                    reorder
                        .num_ref_frames
                        .max(reorder.max_num_reorder_frames),
                )?;
            }
        }

        (w.bits_written(), pos_num_units_in_tick, pos_time_scale)
    };

    Ok(VuiRbsp {
        data,
        size_bits,
        pos_num_units_in_tick,
        pos_time_scale,
    })
}
