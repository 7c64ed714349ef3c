// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DTS recovery for encoded packets.
//!
//! The device returns packets in decode order but only reports their PTS. The
//! PTS of every frame written is remembered in submission order, and the
//! n-th packet out gets the n-th PTS in as its DTS. Reordering GOPs output a
//! picture before the ones it references have been written, so the first
//! `dts_offset` packets get a DTS synthesized backwards from the first PTS
//! instead.

use std::collections::VecDeque;

/// Entries of the PTS ring.
pub const PTS_RING_SIZE: usize = 1024;

#[derive(Debug)]
pub struct ReorderState {
    pts: VecDeque<i64>,
    dts_offset: u32,
    ticks_per_frame: i64,
    first_pts: Option<i64>,
    /// Packets given a DTS so far.
    count: u64,
    latest_dts: i64,
}

impl ReorderState {
    pub fn new(dts_offset: u32, ticks_per_frame: i64) -> Self {
        Self {
            pts: VecDeque::with_capacity(PTS_RING_SIZE),
            dts_offset,
            ticks_per_frame: ticks_per_frame.max(1),
            first_pts: None,
            count: 0,
            latest_dts: 0,
        }
    }

    pub fn dts_offset(&self) -> u32 {
        self.dts_offset
    }

    /// Records the PTS of a frame the device accepted.
    pub fn push_pts(&mut self, pts: i64) {
        if self.pts.len() == PTS_RING_SIZE {
            log::warn!("PTS ring full, dropping oldest entry");
            self.pts.pop_front();
        }
        self.pts.push_back(pts);
    }

    /// Forgets the most recent PTS, for a write that turned out to fail.
    pub fn unpush_pts(&mut self) -> Option<i64> {
        self.pts.pop_back()
    }

    pub fn pending(&self) -> usize {
        self.pts.len()
    }

    /// Sets the PTS the synthesized DTS count back from. Only the first call
    /// after a reset has any effect.
    pub fn set_first_pts(&mut self, pts: i64) {
        self.first_pts.get_or_insert(pts);
    }

    /// DTS of the next packet out, which carries `pts`.
    pub fn next_dts(&mut self, pts: i64) -> i64 {
        let first_pts = *self.first_pts.get_or_insert(pts);

        let mut dts = if self.count < self.dts_offset as u64 {
            first_pts + (self.count as i64 - self.dts_offset as i64) * self.ticks_per_frame
        } else {
            match self.pts.pop_front() {
                Some(dts) => dts,
                None => {
                    log::warn!("no PTS left for packet with pts {}, using it as dts", pts);
                    pts
                }
            }
        };

        if self.count >= 1 && dts < self.latest_dts {
            log::warn!("dts: {} < latest_dts: {}", dts, self.latest_dts);
        }

        if dts > pts {
            log::warn!("dts: {}, pts: {}. Forcing dts = pts", dts, pts);
            dts = pts;
        }

        self.count += 1;
        self.latest_dts = dts;
        dts
    }

    /// Forgets everything about the previous session.
    pub fn reset(&mut self) {
        self.pts.clear();
        self.first_pts = None;
        self.count = 0;
        self.latest_dts = 0;
    }
}
