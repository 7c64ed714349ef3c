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
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub nal_unit_type: u8,
    pub nuh_layer_id: u8,
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn type_(&self) -> Option<NaluType> {
        NaluType::n(self.nal_unit_type)
    }
}

impl Header for NaluHeader {
    fn parse(data: &[u8], offset: usize) -> NaluResult<Self> {
        if data.len() < 2 {
            return Err(NaluError::TruncatedHeader(offset));
        }

        if data[0] & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit(offset));
        }

        Ok(NaluHeader {
            nal_unit_type: (data[0] >> 1) & 0x3f,
            nuh_layer_id: ((data[0] & 0x01) << 5) | (data[1] >> 3),
            nuh_temporal_id_plus1: data[1] & 0x07,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_(), Some(NaluType::EosNut | NaluType::EobNut))
    }

    fn len(&self) -> usize {
        2
    }

    fn nal_unit_type(&self) -> u8 {
        self.nal_unit_type
    }

    fn class(&self) -> NalClass {
        match self.nal_unit_type {
            0..=31 => NalClass::Vcl,
            32..=34 => NalClass::ParameterSet,
            39 | 40 => NalClass::Sei,
            _ => NalClass::Other,
        }
    }

    fn is_random_access(&self) -> bool {
        (16..=23).contains(&self.nal_unit_type)
    }
}
