// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decides when the out of band parameter sets have to be written in front of
//! a packet.
//!
//! The device only learns the stream parameters from the bitstream. Streams
//! whose SPS/PPS (and VPS) travel out of band therefore need them inserted
//! ahead of the first random access picture, and again whenever they change.

use std::fmt::Debug;

use crate::codec::h264;
use crate::codec::h265;
use crate::codec::nalu::Header;
use crate::codec::nalu::NalClass;
use crate::codec::nalu::NalIterator;
use crate::Codec;

#[derive(Debug)]
pub struct HeaderCache {
    codec: Codec,
    cached: Option<Vec<u8>>,
    got_first_idr: bool,
}

impl HeaderCache {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            cached: None,
            got_first_idr: false,
        }
    }

    /// The parameter sets last inserted or seen in band.
    pub fn cached(&self) -> Option<&[u8]> {
        self.cached.as_deref()
    }

    /// Forgets the cached parameter sets so that the next random access
    /// picture gets `current` again.
    pub fn invalidate(&mut self) {
        self.cached = None;
        self.got_first_idr = false;
    }

    /// Returns `true` if `current` has to be written ahead of `packet`.
    ///
    /// The scan stops at the first random access, parameter set or other VCL
    /// unit, whichever comes first.
    pub fn should_prepend(&mut self, packet: &[u8], current: &[u8]) -> bool {
        match self.codec {
            Codec::H264 => self.scan::<h264::NaluHeader>(packet, current),
            Codec::H265 => self.scan::<h265::NaluHeader>(packet, current),
        }
    }

    fn scan<U: Debug + Header>(&mut self, packet: &[u8], current: &[u8]) -> bool {
        for nalu in NalIterator::<U>::new(packet) {
            let hdr = nalu.header();

            if hdr.is_random_access() {
                if self.got_first_idr && self.cached.as_deref() != Some(current) {
                    log::debug!("parameter sets changed, inserting them again");
                    self.got_first_idr = false;
                }

                if !self.got_first_idr {
                    log::trace!("caching {} bytes of parameter sets", current.len());
                    self.cached = Some(current.to_vec());
                    self.got_first_idr = true;
                    return true;
                }

                return false;
            }

            match hdr.class() {
                NalClass::ParameterSet => {
                    // Already in band. Remember them for later comparisons.
                    if self.cached.is_none() {
                        self.cached = Some(current.to_vec());
                    }
                    self.got_first_idr = true;
                    return false;
                }
                NalClass::Vcl => return false,
                _ => (),
            }
        }

        false
    }
}
