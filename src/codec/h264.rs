// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::codec::nalu::Header;
use crate::codec::nalu::NalClass;
use crate::codec::nalu::NaluError;
use crate::codec::nalu::NaluResult;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    /// Raw `nal_unit_type`, kept even for values without a [`NaluType`].
    pub nal_unit_type: u8,
}

impl NaluHeader {
    pub fn type_(&self) -> Option<NaluType> {
        NaluType::n(self.nal_unit_type)
    }
}

impl Header for NaluHeader {
    fn parse(data: &[u8], offset: usize) -> NaluResult<Self> {
        let byte = *data.first().ok_or(NaluError::TruncatedHeader(offset))?;

        if byte & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit(offset));
        }

        Ok(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            nal_unit_type: byte & 0x1f,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_(), Some(NaluType::SeqEnd | NaluType::StreamEnd))
    }

    fn len(&self) -> usize {
        1
    }

    fn nal_unit_type(&self) -> u8 {
        self.nal_unit_type
    }

    fn class(&self) -> NalClass {
        match self.nal_unit_type {
            1..=5 => NalClass::Vcl,
            6 => NalClass::Sei,
            7 | 8 => NalClass::ParameterSet,
            _ => NalClass::Other,
        }
    }

    fn is_random_access(&self) -> bool {
        self.nal_unit_type == NaluType::SliceIdr as u8
    }
}
