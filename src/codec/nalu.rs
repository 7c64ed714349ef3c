// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B start-code scanning shared by the H.264 and H.265 NAL headers.

use std::fmt::Debug;
use std::io::Cursor;

use thiserror::Error;

/// Protocol-level class of a NAL unit. This is all the adapters need to know
/// about a unit to decide where headers and SEI payloads go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NalClass {
    ParameterSet,
    Sei,
    Vcl,
    Other,
}

#[derive(Debug, Error)]
pub enum NaluError {
    #[error("NAL unit at offset {0} is truncated before its header")]
    TruncatedHeader(usize),
    #[error("forbidden_zero_bit set in NAL unit at offset {0}")]
    ForbiddenBit(usize),
    #[error("unsupported codec for NAL scanning: {0}")]
    UnsupportedCodec(String),
}

pub type NaluResult<T> = std::result::Result<T, NaluError>;

pub trait Header: Sized {
    /// Parse the NALU header from the bytes following the start code.
    fn parse(data: &[u8], offset: usize) -> NaluResult<Self>;
    /// Whether this header type indicates EOS.
    fn is_end(&self) -> bool;
    /// The length of the header.
    fn len(&self) -> usize;
    /// Raw `nal_unit_type` value.
    fn nal_unit_type(&self) -> u8;
    fn class(&self) -> NalClass;
    /// IDR for H.264, any IRAP picture for H.265.
    fn is_random_access(&self) -> bool;
}

#[derive(Debug)]
pub struct Nalu<'a, U> {
    header: U,
    /// The whole buffer this NALU was found in. Possibly shared with the other
    /// NALUs in the packet.
    data: &'a [u8],

    size: usize,
    offset: usize,
    sc_offset: usize,
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit, starting at the cursor
    /// position. Returns `Ok(None)` once no start code is left.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> NaluResult<Option<Nalu<'a, U>>> {
        let bitstream: &'a [u8] = cursor.get_ref();
        let pos = usize::try_from(cursor.position()).unwrap_or(usize::MAX);

        let current_nalu_offset = match Self::find_start_code(bitstream, pos) {
            Some(offset) => offset,
            None => {
                cursor.set_position(bitstream.len() as u64);
                return Ok(None);
            }
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // A preceding 00 makes this a four byte start code.
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 0x00 {
            start_code_offset -= 1;
        }

        let nalu_offset = pos + current_nalu_offset + 3;
        cursor.set_position(nalu_offset as u64);

        let hdr = U::parse(&bitstream[nalu_offset..], nalu_offset)?;

        let mut next_nalu_offset = match Self::find_start_code(bitstream, nalu_offset) {
            Some(offset) => offset,
            None => bitstream.len() - nalu_offset,
        };

        // Discard trailing_zero_8bits.
        while next_nalu_offset > 0 && bitstream[nalu_offset + next_nalu_offset - 1] == 0x00 {
            next_nalu_offset -= 1;
        }

        let nal_size = if hdr.is_end() {
            hdr.len()
        } else {
            next_nalu_offset
        };

        Ok(Some(Nalu {
            header: hdr,
            data: bitstream,
            size: nal_size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        }))
    }

    pub fn header(&self) -> &U {
        &self.header
    }

    /// The buffer the NALU was found in.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the first header byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the start code, including the leading zero byte of a four
    /// byte start code.
    pub fn sc_offset(&self) -> usize {
        self.sc_offset
    }

    /// NALU bytes after the header.
    pub fn payload(&self) -> &'a [u8] {
        let start = (self.offset + self.header.len()).min(self.offset + self.size);
        &self.data[start..self.offset + self.size]
    }
}

impl<U> AsRef<[u8]> for Nalu<'_, U> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}

/// Lazy iterator over the NALUs of a buffer.
///
/// The scan can be suspended and resumed: [`NalIterator::position`] returns
/// the offset the next call to `next` will start from, and
/// [`NalIterator::resume`] builds a new iterator from such an offset.
/// Iteration ends at the end of the buffer or on the first malformed header,
/// which is logged.
pub struct NalIterator<'a, U> {
    cursor: Cursor<&'a [u8]>,
    _header: std::marker::PhantomData<U>,
}

impl<'a, U> NalIterator<'a, U> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self::resume(stream, 0)
    }

    pub fn resume(stream: &'a [u8], position: usize) -> Self {
        let mut cursor = Cursor::new(stream);
        cursor.set_position(position as u64);
        Self {
            cursor,
            _header: std::marker::PhantomData,
        }
    }

    pub fn position(&self) -> usize {
        usize::try_from(self.cursor.position()).unwrap_or(usize::MAX)
    }
}

impl<'a, U> Iterator for NalIterator<'a, U>
where
    U: Debug + Header,
{
    type Item = Nalu<'a, U>;

    fn next(&mut self) -> Option<Self::Item> {
        match Nalu::next(&mut self.cursor) {
            Ok(nalu) => nalu,
            Err(e) => {
                log::debug!("stopping NAL scan: {}", e);
                let end = self.cursor.get_ref().len() as u64;
                self.cursor.set_position(end);
                None
            }
        }
    }
}
