// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SEI helpers: locating and extracting user data unregistered payloads in
//! incoming packets, and building the SEI NAL units the encoder appends after
//! the picture data.

use std::fmt::Debug;

use thiserror::Error;

use crate::codec::h264;
use crate::codec::h265;
use crate::codec::nalu::Header;
use crate::codec::nalu::NalClass;
use crate::codec::nalu::NalIterator;
use crate::codec::nalu_writer::escape_payload;
use crate::Codec;

/// `payloadType` of user data unregistered SEI messages.
pub const SEI_TYPE_USER_DATA_UNREGISTERED: u8 = 5;
/// `payloadType` of alternative transfer characteristics SEI messages.
pub const SEI_TYPE_ALTERNATIVE_TRANSFER: u8 = 147;

/// Length of the H.264 closed caption SEI header, up to the caption data.
pub const CC_SEI_HDR_H264_LEN: usize = 17;
/// Length of the H.265 closed caption SEI header, up to the caption data.
pub const CC_SEI_HDR_HEVC_LEN: usize = 18;
/// `marker_bits` followed by the RBSP trailing bits.
pub const CC_SEI_TRAILER: [u8; 2] = [0xff, 0x80];

/// Total bytes of SEI the encoder accepts per frame.
pub const MAX_SEI_BUF_SIZE: usize = 1024;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const RBSP_TRAILING: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeiError {
    #[error("user data unregistered SEI corrupted: length truncated")]
    LengthTruncated,
    #[error("user data unregistered SEI corrupted: {extracted} of {declared} payload bytes present")]
    DataTruncated { declared: usize, extracted: usize },
    #[error("too many closed caption bytes: {0}")]
    ClosedCaptionTooLong(usize),
}

pub type SeiResult<T> = std::result::Result<T, SeiError>;

/// A user data unregistered payload found in a packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDataSei {
    /// Unescaped payload, exactly as long as the declared `payloadSize`.
    pub payload: Vec<u8>,
    /// The packet carried the SEI but no slice data.
    pub no_slice: bool,
}

fn sei_only<U: Debug + Header>(data: &[u8]) -> bool {
    let mut count = 0;
    for nalu in NalIterator::<U>::new(data) {
        count += 1;
        if nalu.header().class() != NalClass::Sei {
            return false;
        }
    }

    if count == 0 {
        log::trace!("no NAL found in packet");
    }

    count > 0
}

/// Whether every NAL unit in `data` is an SEI. A buffer without any NAL unit
/// is not SEI-only.
pub fn is_sei_only(codec: Codec, data: &[u8]) -> bool {
    match codec {
        Codec::H264 => sei_only::<h264::NaluHeader>(data),
        Codec::H265 => sei_only::<h265::NaluHeader>(data),
    }
}

/// Decodes `payloadSize` starting at `data[0]`, then copies that many payload
/// bytes, dropping every emulation prevention `03` that follows `00 00` in the
/// source.
pub fn extract_payload(data: &[u8]) -> SeiResult<Vec<u8>> {
    let mut index = 0;
    let mut size = 0usize;

    while index < data.len() && data[index] == 0xff {
        size += 0xff;
        index += 1;
    }

    if index >= data.len() {
        log::warn!("user data unregistered SEI corrupted: length truncated");
        return Err(SeiError::LengthTruncated);
    }
    size += data[index] as usize;
    index += 1;

    let src = &data[index..];
    let mut payload = Vec::with_capacity(size);
    for i in 0..src.len() {
        if payload.len() >= size {
            break;
        }
        if i >= 2 && src[i - 2] == 0x00 && src[i - 1] == 0x00 && src[i] == 0x03 {
            continue;
        }
        payload.push(src[i]);
    }

    if payload.len() != size {
        log::warn!("user data unregistered SEI corrupted: data truncated");
        return Err(SeiError::DataTruncated {
            declared: size,
            extracted: payload.len(),
        });
    }

    Ok(payload)
}

fn find_udu<U: Debug + Header>(
    data: &[u8],
    is_udu: impl Fn(&U, &[u8]) -> bool,
) -> SeiResult<Option<UserDataSei>> {
    let mut found: Option<Vec<u8>> = None;
    let mut got_slice = false;

    for nalu in NalIterator::<U>::new(data) {
        let hdr = nalu.header();
        let payload = nalu.payload();

        if found.is_none() && hdr.class() == NalClass::Sei && is_udu(hdr, payload) {
            // The payload size follows the payload type byte. Extraction is
            // allowed to run past the NAL into the rest of the packet.
            let start = nalu.offset() + hdr.len() + 1;
            found = Some(extract_payload(&data[start..])?);
        } else if hdr.class() == NalClass::Vcl {
            got_slice = true;
            break;
        }
    }

    Ok(found.map(|payload| UserDataSei {
        payload,
        no_slice: !got_slice,
    }))
}

/// Looks for a user data unregistered SEI ahead of the first slice of `data`
/// and extracts its payload. Only the first such SEI is returned, and the
/// search never goes past the first VCL unit.
pub fn find_user_data_unregistered(codec: Codec, data: &[u8]) -> SeiResult<Option<UserDataSei>> {
    match codec {
        Codec::H264 => find_udu::<h264::NaluHeader>(data, |hdr, payload| {
            hdr.nal_unit_type == h264::NaluType::Sei as u8
                && payload.first() == Some(&SEI_TYPE_USER_DATA_UNREGISTERED)
        }),
        Codec::H265 => find_udu::<h265::NaluHeader>(data, |hdr, payload| {
            hdr.nal_unit_type == h265::NaluType::PrefixSeiNut as u8
                && hdr.nuh_layer_id == 0
                && hdr.nuh_temporal_id_plus1 == 1
                && payload.first() == Some(&SEI_TYPE_USER_DATA_UNREGISTERED)
        }),
    }
}

/// Start code and SEI NAL header for `codec`.
fn sei_nal_prefix(codec: Codec) -> &'static [u8] {
    match codec {
        Codec::H264 => &[0x00, 0x00, 0x00, 0x01, 0x06],
        Codec::H265 => &[0x00, 0x00, 0x00, 0x01, 0x4e, 0x01],
    }
}

fn write_payload_size(out: &mut Vec<u8>, mut size: usize) {
    while size >= 0xff {
        out.push(0xff);
        size -= 0xff;
    }
    out.push(size as u8);
}

/// Header of an ATSC A/53 closed caption SEI carrying `cc_len` bytes of
/// `cc_data` triplets.
pub fn closed_caption_header(codec: Codec, cc_len: usize) -> SeiResult<Vec<u8>> {
    let cc_count = cc_len / 3;
    if cc_count > 0x1f || cc_len + 11 > 0xff {
        return Err(SeiError::ClosedCaptionTooLong(cc_len));
    }

    let mut hdr = sei_nal_prefix(codec).to_vec();
    hdr.extend_from_slice(&[
        0x04,               // payloadType: user data registered ITU-T T.35
        (cc_len + 11) as u8, // payloadSize
        0xb5,               // itu_t_t35_country_code
        0x00,
        0x31, // itu_t_t35_provider_code
        0x47,
        0x41,
        0x39,
        0x34, // "GA94"
        0x03, // user_data_type_code: cc_data
        (cc_count as u8) | 0xc0,
        0xff, // em_data
    ]);

    Ok(hdr)
}

/// Complete closed caption SEI NAL unit.
pub fn closed_caption_sei(codec: Codec, cc_data: &[u8]) -> SeiResult<Vec<u8>> {
    let mut sei = closed_caption_header(codec, cc_data.len())?;
    sei.extend_from_slice(cc_data);
    sei.extend_from_slice(&CC_SEI_TRAILER);
    Ok(sei)
}

/// Alternative transfer characteristics SEI announcing `transfer` as the
/// preferred transfer function.
pub fn preferred_transfer_sei(codec: Codec, transfer: u8) -> Vec<u8> {
    let mut sei = sei_nal_prefix(codec).to_vec();
    sei.extend_from_slice(&[SEI_TYPE_ALTERNATIVE_TRANSFER, 0x01, transfer, RBSP_TRAILING]);
    sei
}

/// Size of the user data unregistered SEI NAL unit built from a payload of
/// `payload_len` bytes that escapes to `escaped_len` bytes.
pub fn user_data_unregistered_len(codec: Codec, payload_len: usize, escaped_len: usize) -> usize {
    // prefix + payload type + payloadSize bytes + payload + trailing byte
    sei_nal_prefix(codec).len() + 1 + payload_len / 0xff + 1 + escaped_len + 1
}

/// User data unregistered SEI NAL unit around `payload`. The payload size is
/// the unescaped size and the payload bytes are emulation-prevention escaped.
pub fn user_data_unregistered_sei(codec: Codec, payload: &[u8]) -> Vec<u8> {
    let escaped = escape_payload(payload);
    let mut sei =
        Vec::with_capacity(user_data_unregistered_len(codec, payload.len(), escaped.len()));
    sei.extend_from_slice(sei_nal_prefix(codec));
    sei.push(SEI_TYPE_USER_DATA_UNREGISTERED);
    write_payload_size(&mut sei, payload.len());
    sei.extend_from_slice(&escaped);
    sei.push(RBSP_TRAILING);
    sei
}
