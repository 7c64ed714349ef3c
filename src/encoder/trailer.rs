// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame auxiliary data written after the picture.
//!
//! The device reads the trailer as consecutive segments whose sizes travel in
//! [`ExtraDataLayout`]: the change parameters block, the ROI map, then the SEI
//! NAL units (closed caption, preferred transfer, user data unregistered).
//! The change parameters block is sent whenever a ROI map or SEI follows,
//! even if nothing changes.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::ExtraDataLayout;
use crate::codec::sei;
use crate::codec::sei::SeiResult;
use crate::codec::sei::MAX_SEI_BUF_SIZE;
use crate::Codec;

/// Serialized size of [`EncoderChangeParams`].
pub const CHANGE_PARAMS_SIZE: usize = 128;

pub const CHANGE_PARAM_INTRA_PARAM: u32 = 0x0002;
pub const CHANGE_PARAM_RC_TARGET_RATE: u32 = 0x0100;
pub const CHANGE_PARAM_RC: u32 = 0x0200;
pub const CHANGE_PARAM_RC_MIN_MAX_QP: u32 = 0x0400;

/// Encoding parameters changed on the fly. Only the groups flagged in
/// `enable_option` are applied by the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderChangeParams {
    pub enable_option: u32,
    pub bit_rate: i32,
    pub intra_qp: i32,
    pub intra_period: i32,
    pub repeat_headers: i32,
    pub hvs_qp_enable: i32,
    pub hvs_qp_scale: i32,
    pub vbv_buffer_size: i32,
    pub mb_level_rc_enable: i32,
    pub filler_enable: i32,
    pub min_qp_i: i32,
    pub max_qp_i: i32,
    pub max_delta_qp: i32,
    pub min_qp_p: i32,
    pub min_qp_b: i32,
    pub max_qp_p: i32,
    pub max_qp_b: i32,
}

impl EncoderChangeParams {
    pub fn to_bytes(&self) -> [u8; CHANGE_PARAMS_SIZE] {
        let mut buf = [0u8; CHANGE_PARAMS_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.enable_option);

        let fields = [
            self.bit_rate,
            self.intra_qp,
            self.intra_period,
            self.repeat_headers,
            self.hvs_qp_enable,
            self.hvs_qp_scale,
            self.vbv_buffer_size,
            self.mb_level_rc_enable,
            self.filler_enable,
            self.min_qp_i,
            self.max_qp_i,
            self.max_delta_qp,
            self.min_qp_p,
            self.min_qp_b,
            self.max_qp_p,
            self.max_qp_b,
        ];
        LittleEndian::write_i32_into(&fields, &mut buf[4..4 + 4 * fields.len()]);

        buf
    }
}

/// Collects the trailer segments of one frame.
///
/// SEI segments count against [`MAX_SEI_BUF_SIZE`]. User data unregistered
/// SEI is the first thing to go when the budget runs out.
pub struct ExtraDataBuilder {
    codec: Codec,
    change_params: Option<EncoderChangeParams>,
    roi: Option<(Vec<u8>, u32)>,
    closed_caption: Option<Vec<u8>>,
    preferred_transfer: Option<Vec<u8>>,
    user_data: Option<Vec<u8>>,
}

impl ExtraDataBuilder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            change_params: None,
            roi: None,
            closed_caption: None,
            preferred_transfer: None,
            user_data: None,
        }
    }

    /// Parameters to apply with this frame.
    pub fn change_params(&mut self, params: EncoderChangeParams) -> &mut Self {
        self.change_params = Some(params);
        self
    }

    pub fn roi(&mut self, map: &[u8], avg_qp: u32) -> &mut Self {
        self.roi = Some((map.to_vec(), avg_qp));
        self
    }

    pub fn closed_caption(&mut self, cc_data: &[u8]) -> SeiResult<&mut Self> {
        self.closed_caption = Some(sei::closed_caption_sei(self.codec, cc_data)?);
        Ok(self)
    }

    pub fn preferred_transfer(&mut self, transfer: u8) -> &mut Self {
        self.preferred_transfer = Some(sei::preferred_transfer_sei(self.codec, transfer));
        self
    }

    pub fn user_data_unregistered(&mut self, payload: &[u8]) -> &mut Self {
        self.user_data = Some(sei::user_data_unregistered_sei(self.codec, payload));
        self
    }

    fn sei_len(&self) -> usize {
        self.closed_caption.as_ref().map_or(0, Vec::len)
            + self.preferred_transfer.as_ref().map_or(0, Vec::len)
    }

    /// Concatenates the segments. `current` is the change parameters block
    /// sent when only ROI or SEI data needs one.
    pub fn build(mut self, current: &EncoderChangeParams) -> (Vec<u8>, ExtraDataLayout) {
        let mut layout = ExtraDataLayout::default();

        let udu_len = self.user_data.as_ref().map_or(0, Vec::len);
        if udu_len > 0 && self.sei_len() + udu_len > MAX_SEI_BUF_SIZE {
            log::warn!(
                "discarding user data SEI of {} bytes, {} bytes of SEI already queued (max {})",
                udu_len,
                self.sei_len(),
                MAX_SEI_BUF_SIZE
            );
            self.user_data = None;
        }

        let sei_total = self.sei_len() + self.user_data.as_ref().map_or(0, Vec::len);
        // Closed captions and transfer SEI are bounded, user data was dropped above.
        debug_assert!(sei_total <= MAX_SEI_BUF_SIZE, "SEI of {} bytes", sei_total);

        let needs_block = self.change_params.is_some() || self.roi.is_some() || sei_total > 0;
        if !needs_block {
            return (Vec::new(), layout);
        }

        let mut out = Vec::with_capacity(CHANGE_PARAMS_SIZE + sei_total);
        let block = self.change_params.as_ref().unwrap_or(current);
        out.extend_from_slice(&block.to_bytes());
        layout.reconf_len = CHANGE_PARAMS_SIZE;

        if let Some((map, avg_qp)) = &self.roi {
            out.extend_from_slice(map);
            layout.roi_len = map.len();
            layout.roi_avg_qp = *avg_qp;
        }

        for (segment, len) in [
            (&self.closed_caption, &mut layout.sei_cc_len),
            (&self.preferred_transfer, &mut layout.preferred_characteristics_len),
            (&self.user_data, &mut layout.udu_sei_len),
        ] {
            if let Some(data) = segment {
                out.extend_from_slice(data);
                *len = data.len();
            }
        }

        log::trace!("trailer {:?}", layout);
        (out, layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_params_layout() {
        let params = EncoderChangeParams {
            enable_option: CHANGE_PARAM_RC_TARGET_RATE,
            bit_rate: 1_000_000,
            max_qp_b: -1,
            ..Default::default()
        };
        let bytes = params.to_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(LittleEndian::read_i32(&bytes[4..8]), 1_000_000);
        assert_eq!(LittleEndian::read_i32(&bytes[64..68]), -1);
        assert!(bytes[68..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_trailer() {
        let (data, layout) = ExtraDataBuilder::new(Codec::H264)
            .build(&EncoderChangeParams::default());
        assert!(data.is_empty());
        assert_eq!(layout, ExtraDataLayout::default());
    }

    #[test]
    fn segments_in_order() {
        let mut builder = ExtraDataBuilder::new(Codec::H265);
        builder
            .user_data_unregistered(&[0x11; 20])
            .preferred_transfer(16)
            .roi(&[0xaa; 32], 25);
        builder.closed_caption(&[0xfc, 0x80, 0x80]).unwrap();
        let (data, layout) = builder.build(&EncoderChangeParams::default());

        assert_eq!(layout.reconf_len, CHANGE_PARAMS_SIZE);
        assert_eq!(layout.roi_len, 32);
        assert_eq!(layout.roi_avg_qp, 25);
        assert_eq!(layout.sei_cc_len, 18 + 3 + 2);
        assert_eq!(layout.preferred_characteristics_len, 10);
        assert_eq!(data.len(), layout.total_len());

        // The block only carries ROI and SEI, it changes nothing.
        assert!(data[..CHANGE_PARAMS_SIZE].iter().all(|&b| b == 0));
        assert_eq!(data[CHANGE_PARAMS_SIZE], 0xaa);

        let cc = CHANGE_PARAMS_SIZE + 32;
        assert_eq!(&data[cc + layout.sei_cc_len - 2..cc + layout.sei_cc_len], &[0xff, 0x80]);
        let pref = cc + layout.sei_cc_len;
        assert_eq!(data[pref + 6], sei::SEI_TYPE_ALTERNATIVE_TRANSFER);
        let udu = pref + layout.preferred_characteristics_len;
        assert_eq!(data[udu + 6], sei::SEI_TYPE_USER_DATA_UNREGISTERED);
        assert_eq!(data.last(), Some(&0x80));
    }

    #[test]
    fn reuses_current_block() {
        let current = EncoderChangeParams {
            bit_rate: 42,
            ..Default::default()
        };
        let mut builder = ExtraDataBuilder::new(Codec::H264);
        builder.preferred_transfer(1);
        let (data, layout) = builder.build(&current);
        assert_eq!(layout.preferred_characteristics_len, 9);
        assert_eq!(LittleEndian::read_i32(&data[4..8]), 42);
    }

    #[test]
    fn oversized_user_data_is_dropped() {
        let mut builder = ExtraDataBuilder::new(Codec::H264);
        builder.preferred_transfer(16).user_data_unregistered(&[0x22; 1100]);
        let (_, layout) = builder.build(&EncoderChangeParams::default());
        assert_eq!(layout.udu_sei_len, 0);
        assert_eq!(layout.sei_total_len(), 9);
    }
}
