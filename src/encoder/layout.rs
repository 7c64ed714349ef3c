// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Placement of raw pictures in the encoder's input layout.
//!
//! The device wants luma rows 32-pixel aligned and at least 256 pixels wide,
//! and the picture height aligned to the codec's coding unit and at least 128
//! rows. A frame already laid out that way, in page aligned memory, can be
//! handed over as is. Anything else is copied, with the right edge and the
//! bottom rows filled by replicating the last pixel and row.

use crate::align_up;
use crate::backend::FramePlanes;
use crate::encoder::RawFrame;
use crate::Codec;
use crate::MIN_HEIGHT;
use crate::MIN_WIDTH;

/// Transfers of frames with non-contiguous planes must fit in this many
/// pages.
pub const MAX_SPLIT_PLANE_PAGES: u32 = 511;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// System page size.
pub fn page_size() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Hardware input layout of one picture size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwLayout {
    /// Luma width in pixels the rows are padded to.
    pub width: usize,
    pub bit_depth_factor: usize,
    /// Bytes per row.
    pub strides: [usize; 3],
    /// Rows per plane.
    pub heights: [usize; 3],
    pub offsets: [usize; 3],
    pub size: usize,
}

impl HwLayout {
    pub fn new(codec: Codec, width: u32, height: u32, bit_depth_factor: u32) -> Self {
        let bdf = bit_depth_factor as usize;
        let aligned_width = align_up(width, 32).max(MIN_WIDTH) as usize;
        let aligned_height = align_up(height, codec.alignment()).max(MIN_HEIGHT) as usize;

        let luma_stride = aligned_width * bdf;
        let chroma_stride = luma_stride / 2;
        let strides = [luma_stride, chroma_stride, chroma_stride];
        let heights = [aligned_height, aligned_height / 2, aligned_height / 2];

        let luma = strides[0] * heights[0];
        let chroma = strides[1] * heights[1];

        Self {
            width: aligned_width,
            bit_depth_factor: bdf,
            strides,
            heights,
            offsets: [0, luma, luma + chroma],
            size: luma + 2 * chroma,
        }
    }

    pub fn strides_u32(&self) -> [u32; 3] {
        self.strides.map(|s| s as u32)
    }
}

/// Inputs of the zero copy decision that do not come from the frame.
#[derive(Copy, Clone, Debug)]
pub struct ZeroCopyPolicy {
    /// The user allows passing frames without copying.
    pub enabled: bool,
    /// The firmware reports zero copy support.
    pub supported: bool,
    /// Right edge padding is needed and configured.
    pub pads_right_edge: bool,
    pub page_size: usize,
    /// Transfer size of the session.
    pub io_size: u32,
}

/// How a frame goes to the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Pass the caller's planes. Transfers are capped to `io_size` if set.
    ZeroCopy { io_size: Option<u32> },
    Copy,
}

fn is_aligned(ptr: *const u8, page_size: usize) -> bool {
    (ptr as usize) % page_size == 0
}

/// Decides, for this frame only, whether its planes can be used in place.
pub fn placement(frame: &RawFrame, layout: &HwLayout, policy: &ZeroCopyPolicy) -> Placement {
    let reject = |reason: &str| {
        log::trace!("copying frame: {}", reason);
        Placement::Copy
    };

    if !policy.enabled {
        return reject("zero copy disabled");
    }
    if layout.width != frame.resolution.width as usize
        || layout.heights[0] != frame.resolution.height as usize
    {
        return reject("picture needs alignment padding");
    }
    if policy.pads_right_edge {
        return reject("right edge padding configured");
    }
    if !policy.supported {
        return reject("firmware has no zero copy support");
    }

    let page = policy.page_size.max(1);
    let ptrs = [
        frame.planes[0].as_ptr(),
        frame.planes[1].as_ptr(),
        frame.planes[2].as_ptr(),
    ];
    if !is_aligned(ptrs[0], page) {
        return reject("luma not page aligned");
    }
    for i in 0..3 {
        if frame.strides[i] != layout.strides[i] {
            return reject("stride differs from the hardware stride");
        }
        if frame.planes[i].len() < layout.strides[i] * layout.heights[i] {
            return reject("plane shorter than the hardware layout");
        }
    }

    let contiguous = (ptrs[1] as usize).wrapping_sub(ptrs[0] as usize) == layout.offsets[1]
        && (ptrs[2] as usize).wrapping_sub(ptrs[1] as usize)
            == layout.offsets[2] - layout.offsets[1];
    if contiguous {
        return Placement::ZeroCopy { io_size: None };
    }

    if !is_aligned(ptrs[1], page) || !is_aligned(ptrs[2], page) {
        return reject("separate chroma planes not page aligned");
    }

    let cap = MAX_SPLIT_PLANE_PAGES * page as u32;
    Placement::ZeroCopy {
        io_size: (policy.io_size > cap).then_some(cap),
    }
}

/// Copies `frame` into the hardware layout.
///
/// Rows past the picture are copies of its last row. With `pad_right`, the
/// columns past the picture repeat its last sample.
pub fn copy_planes(frame: &RawFrame, layout: &HwLayout, pad_right: bool) -> FramePlanes {
    let bdf = layout.bit_depth_factor;
    let mut data = vec![0u8; layout.size];
    let mut pad_px = 0;

    for i in 0..3 {
        let dst_stride = layout.strides[i];
        let src_stride = frame.strides[i];
        let src = &frame.planes[i];
        let rows = frame.plane_height(i).min(layout.heights[i]);
        let plane = &mut data[layout.offsets[i]..layout.offsets[i] + dst_stride * layout.heights[i]];

        pad_px = match i {
            0 => layout.width.saturating_sub(frame.resolution.width as usize),
            1 => pad_px + pad_px % 2,
            _ => pad_px,
        };
        let pad_bytes = if i == 0 { pad_px * bdf } else { pad_px * bdf / 2 };
        let row_len = src_stride.min(dst_stride);

        for row in 0..rows {
            let start = (row * src_stride).min(src.len());
            let end = (start + row_len).min(src.len());
            let dst = &mut plane[row * dst_stride..(row + 1) * dst_stride];
            dst[..end - start].copy_from_slice(&src[start..end]);

            if pad_right && pad_bytes > 0 && pad_bytes + bdf <= dst_stride {
                let edge = dst_stride - pad_bytes;
                if bdf == 2 {
                    let sample = [dst[edge - 2], dst[edge - 1]];
                    for px in dst[edge..].chunks_exact_mut(2) {
                        px.copy_from_slice(&sample);
                    }
                } else {
                    let sample = dst[edge - 1];
                    dst[edge..].fill(sample);
                }
            }
        }

        if rows > 0 {
            let last = (rows - 1) * dst_stride;
            for row in rows..layout.heights[i] {
                plane.copy_within(last..last + dst_stride, row * dst_stride);
            }
        }
    }

    FramePlanes::Copied {
        data,
        offsets: layout.offsets,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::backend::MAX_TRANSFER_SIZE;
    use crate::PixelFormat;
    use crate::Resolution;

    const PAGE: usize = 4096;

    /// `len` bytes starting on a page boundary.
    fn page_aligned(len: usize) -> Bytes {
        let buf = Bytes::from(vec![0u8; len + PAGE]);
        let skip = (PAGE - buf.as_ptr() as usize % PAGE) % PAGE;
        buf.slice(skip..skip + len)
    }

    fn policy() -> ZeroCopyPolicy {
        ZeroCopyPolicy {
            enabled: true,
            supported: true,
            pads_right_edge: false,
            page_size: PAGE,
            io_size: MAX_TRANSFER_SIZE,
        }
    }

    fn contiguous_frame(layout: &HwLayout, resolution: Resolution) -> RawFrame {
        let buf = page_aligned(layout.size);
        RawFrame {
            planes: [
                buf.slice(layout.offsets[0]..layout.offsets[1]),
                buf.slice(layout.offsets[1]..layout.offsets[2]),
                buf.slice(layout.offsets[2]..),
            ],
            strides: layout.strides,
            resolution,
            ..Default::default()
        }
    }

    #[test]
    fn hardware_layout() {
        let layout = HwLayout::new(Codec::H264, 1920, 1080, 1);
        assert_eq!(layout.strides, [1920, 960, 960]);
        assert_eq!(layout.heights, [1088, 544, 544]);
        assert_eq!(layout.size, 1920 * 1088 * 3 / 2);

        let layout = HwLayout::new(Codec::H265, 1920, 1080, 2);
        assert_eq!(layout.strides, [3840, 1920, 1920]);
        assert_eq!(layout.heights[0], 1080);

        let layout = HwLayout::new(Codec::H265, 176, 100, 1);
        assert_eq!(layout.width, 256);
        assert_eq!(layout.heights, [128, 64, 64]);
    }

    #[test]
    fn zero_copy_for_aligned_contiguous_frames() {
        let resolution = Resolution::new(256, 128);
        let layout = HwLayout::new(Codec::H264, 256, 128, 1);
        let frame = contiguous_frame(&layout, resolution);
        assert_eq!(placement(&frame, &layout, &policy()), Placement::ZeroCopy { io_size: None });

        let disabled = ZeroCopyPolicy {
            enabled: false,
            ..policy()
        };
        assert_eq!(placement(&frame, &layout, &disabled), Placement::Copy);
        let unsupported = ZeroCopyPolicy {
            supported: false,
            ..policy()
        };
        assert_eq!(placement(&frame, &layout, &unsupported), Placement::Copy);
        let padded = ZeroCopyPolicy {
            pads_right_edge: true,
            ..policy()
        };
        assert_eq!(placement(&frame, &layout, &padded), Placement::Copy);
    }

    #[test]
    fn separate_planes_cap_the_transfer() {
        let layout = HwLayout::new(Codec::H264, 256, 128, 1);
        let frame = RawFrame {
            planes: [
                page_aligned(256 * 128),
                page_aligned(128 * 64),
                page_aligned(128 * 64),
            ],
            strides: layout.strides,
            resolution: Resolution::new(256, 128),
            ..Default::default()
        };
        assert_eq!(
            placement(&frame, &layout, &policy()),
            Placement::ZeroCopy {
                io_size: Some(511 * 4096)
            }
        );
    }

    #[test]
    fn copy_when_misaligned_or_padded() {
        let layout = HwLayout::new(Codec::H264, 256, 128, 1);
        let mut frame = contiguous_frame(&layout, Resolution::new(256, 128));
        frame.planes[0] = frame.planes[0].slice(1..);
        assert_eq!(placement(&frame, &layout, &policy()), Placement::Copy);

        // 240 pixels are padded to 256.
        let layout = HwLayout::new(Codec::H264, 240, 128, 1);
        let frame = contiguous_frame(&layout, Resolution::new(240, 128));
        assert_eq!(placement(&frame, &layout, &policy()), Placement::Copy);
    }

    fn gradient_frame(width: usize, height: usize, format: PixelFormat) -> RawFrame {
        let bdf = format.bit_depth_factor() as usize;
        let plane = |w: usize, h: usize| {
            let mut data = Vec::with_capacity(w * h * bdf);
            for row in 0..h {
                for col in 0..w * bdf {
                    let edge = (w - 1) * bdf;
                    data.push(if col >= edge { 0xe0 + (col - edge) as u8 } else { row as u8 });
                }
            }
            Bytes::from(data)
        };

        RawFrame {
            planes: [
                plane(width, height),
                plane(width / 2, height / 2),
                plane(width / 2, height / 2),
            ],
            strides: [width * bdf, width / 2 * bdf, width / 2 * bdf],
            resolution: Resolution::new(width as u32, height as u32),
            format,
            ..Default::default()
        }
    }

    #[test]
    fn copy_replicates_edges() {
        let frame = gradient_frame(250, 100, PixelFormat::I420);
        let layout = HwLayout::new(Codec::H264, 250, 100, 1);
        let FramePlanes::Copied { data, offsets } = copy_planes(&frame, &layout, true) else {
            panic!("expected a copy");
        };

        let luma = &data[..256 * 128];
        assert_eq!(luma[10 * 256 + 3], 10);
        assert_eq!(&luma[10 * 256 + 249..11 * 256], &[0xe0; 7]);
        // Bottom rows repeat row 99.
        assert_eq!(&luma[127 * 256..128 * 256], &luma[99 * 256..100 * 256]);

        // Chroma is 125 wide in a 128 byte stride.
        let u = &data[offsets[1]..offsets[2]];
        assert_eq!(&u[5 * 128 + 124..6 * 128], &[0xe0; 4]);
        assert_eq!(&u[63 * 128..64 * 128], &u[49 * 128..50 * 128]);

        let FramePlanes::Copied { data, .. } = copy_planes(&frame, &layout, false) else {
            panic!("expected a copy");
        };
        assert_eq!(data[10 * 256 + 249], 0xe0);
        assert_eq!(&data[10 * 256 + 250..11 * 256], &[0; 6]);
    }

    #[test]
    fn copy_replicates_ten_bit_samples() {
        let frame = gradient_frame(250, 100, PixelFormat::I420P10Le);
        let layout = HwLayout::new(Codec::H265, 250, 100, 2);
        let FramePlanes::Copied { data, .. } = copy_planes(&frame, &layout, true) else {
            panic!("expected a copy");
        };

        let row = &data[3 * 512..4 * 512];
        assert_eq!(row[0], 3);
        for px in row[498..].chunks_exact(2) {
            assert_eq!(px, &[0xe0, 0xe1]);
        }
    }
}
