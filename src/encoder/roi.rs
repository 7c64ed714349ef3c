// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Region of interest QP maps for the ROI demo modes.
//!
//! H.264 maps hold one 4-byte entry per 16x16 macroblock. HEVC maps hold one
//! 8-byte entry per 64x64 CTU carrying the QPs of its four 32x32 sub-CTUs.
//! The centre third of every row gets one importance level and the rest the
//! other.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::Codec;
use crate::Resolution;

const AVC_ENTRY_SIZE: usize = 4;
const HEVC_ENTRY_SIZE: usize = 8;
const QP_MASK: u32 = 0x3f;

/// A custom map, built once per session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoiMap {
    data: Vec<u8>,
    avg_qp: u32,
}

impl RoiMap {
    /// Builds the map for demo `mode` (1 or 2) over the coded picture size.
    /// Other modes have no map.
    pub fn demo(codec: Codec, mode: u32, coded: Resolution) -> Option<Self> {
        let (centre, rest) = match mode {
            1 => (40, 10),
            2 => (10, 40),
            _ => return None,
        };

        let map = match codec {
            Codec::H264 => Self::avc(coded, centre, rest),
            Codec::H265 => Self::hevc(coded, centre, rest),
        };
        log::debug!(
            "ROI demo map mode {}: {} bytes, average qp {}",
            mode,
            map.data.len(),
            map.avg_qp
        );
        Some(map)
    }

    fn level(index: usize, row_len: usize, centre: u32, rest: u32) -> u32 {
        let col = index % row_len;
        if col > row_len / 3 && col < row_len * 2 / 3 {
            centre
        } else {
            rest
        }
    }

    fn avc(coded: Resolution, centre: u32, rest: u32) -> Self {
        let mb_width = (coded.width as usize).div_ceil(16);
        let mb_height = (coded.height as usize).div_ceil(16);
        let num_mbs = mb_width * mb_height;

        let mut data = vec![0u8; (num_mbs * AVC_ENTRY_SIZE).div_ceil(16) * 16];
        let mut sum = 0;
        for (i, entry) in data.chunks_exact_mut(AVC_ENTRY_SIZE).take(num_mbs).enumerate() {
            let qp = Self::level(i, mb_width, centre, rest);
            LittleEndian::write_u32(entry, qp & QP_MASK);
            sum += qp as usize;
        }

        Self {
            data,
            avg_qp: ((sum + num_mbs / 2) / num_mbs.max(1)) as u32,
        }
    }

    fn hevc(coded: Resolution, centre: u32, rest: u32) -> Self {
        let ctu_width = (coded.width as usize).div_ceil(64);
        let ctu_height = (coded.height as usize).div_ceil(64);
        let sub_width = ctu_width * 2;
        let num_sub_ctus = sub_width * ctu_height * 2;

        let sub_ctus: Vec<u32> = (0..num_sub_ctus)
            .map(|i| Self::level(i, sub_width, centre, rest))
            .collect();

        let mut data = vec![0u8; (ctu_width * ctu_height * HEVC_ENTRY_SIZE).div_ceil(16) * 16];
        let mut sum = 0;
        for row in 0..ctu_height {
            for col in 0..ctu_width {
                let top = row * 2 * sub_width + col * 2;
                let qps = [
                    sub_ctus[top],
                    sub_ctus[top + 1],
                    sub_ctus[top + sub_width],
                    sub_ctus[top + sub_width + 1],
                ];
                sum += qps.iter().sum::<u32>() as usize;

                // sub_ctu_qp_0..3 take 6 bits each, the second word is unused.
                let packed = qps
                    .iter()
                    .enumerate()
                    .fold(0u32, |acc, (k, qp)| acc | (qp & QP_MASK) << (6 * k));
                let ctu = row * ctu_width + col;
                LittleEndian::write_u32(&mut data[ctu * HEVC_ENTRY_SIZE..][..4], packed);
            }
        }

        Self {
            data,
            avg_qp: ((sum + num_sub_ctus / 2) / num_sub_ctus.max(1)) as u32,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn avg_qp(&self) -> u32 {
        self.avg_qp
    }
}
