// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scripted reconfiguration, replayed from a `ReconfFile`.
//!
//! Each line of the file is `<frame>:<v1>,<v2>,...` and the meaning of the
//! values depends on the [`ReconfDemoMode`]. Empty lines and lines starting
//! with `#` are skipped.

use std::path::Path;

use crate::config::ConfigError;
use crate::config::ConfigResult;
use crate::config::ReconfDemoMode;
use crate::encoder::trailer::EncoderChangeParams;
use crate::encoder::trailer::CHANGE_PARAM_INTRA_PARAM;
use crate::encoder::trailer::CHANGE_PARAM_RC;
use crate::encoder::trailer::CHANGE_PARAM_RC_MIN_MAX_QP;
use crate::encoder::trailer::CHANGE_PARAM_RC_TARGET_RATE;
use crate::encoder::LongTermRef;

#[derive(Clone, Debug, PartialEq, Eq)]
struct ReconfEntry {
    frame: u64,
    values: Vec<i32>,
}

/// What the schedule asks of one frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconfAction {
    /// The change parameters were updated and must go out with the frame.
    ChangeParams,
    LongTermRef(LongTermRef),
}

#[derive(Clone, Debug)]
pub struct ReconfSchedule {
    mode: ReconfDemoMode,
    entries: Vec<ReconfEntry>,
    next: usize,
}

impl ReconfSchedule {
    pub fn parse(mode: ReconfDemoMode, text: &str) -> ConfigResult<Self> {
        let wanted = mode.values_per_entry();
        let mut entries: Vec<ReconfEntry> = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let err = |reason: &str| ConfigError::ReconfFile {
                line: line_no,
                reason: reason.to_string(),
            };

            let (frame, values) = line.split_once(':').ok_or_else(|| err("missing ':'"))?;
            let frame: u64 = frame
                .trim()
                .parse()
                .map_err(|_| err("invalid frame number"))?;
            let values = values
                .split(',')
                .map(|v| v.trim().parse::<i32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| err("invalid value"))?;

            if values.len() < wanted {
                return Err(err(&format!("expected {} values, got {}", wanted, values.len())));
            }
            if entries.last().is_some_and(|last| last.frame >= frame) {
                return Err(err("frame numbers must increase"));
            }

            entries.push(ReconfEntry { frame, values });
        }

        log::debug!("{} reconfiguration entries for {:?}", entries.len(), mode);
        Ok(Self {
            mode,
            entries,
            next: 0,
        })
    }

    pub fn load(mode: ReconfDemoMode, path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(mode, &text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the entry due at `frame_num`, if any, to `params`.
    ///
    /// Long-term reference settings hold from their frame until the next
    /// entry, every other mode fires once on its exact frame.
    pub fn apply(
        &mut self,
        frame_num: u64,
        params: &mut EncoderChangeParams,
    ) -> Option<ReconfAction> {
        let entry = self.entries.get(self.next)?;
        let v = &entry.values;

        if self.mode == ReconfDemoMode::LongTermRef {
            let action = (frame_num >= entry.frame).then(|| {
                ReconfAction::LongTermRef(LongTermRef {
                    use_cur_src_as_long_term_pic: v[0].clamp(0, u8::MAX as i32) as u8,
                    use_long_term_ref: v[1].clamp(0, u8::MAX as i32) as u8,
                })
            });
            if self
                .entries
                .get(self.next + 1)
                .is_some_and(|next| next.frame == frame_num + 1)
            {
                self.next += 1;
            }
            return action;
        }

        if frame_num != entry.frame {
            return None;
        }

        match self.mode {
            ReconfDemoMode::Bitrate => {
                params.enable_option = CHANGE_PARAM_RC_TARGET_RATE;
                params.bit_rate = v[0];
            }
            ReconfDemoMode::IntraPeriod => {
                params.enable_option = CHANGE_PARAM_INTRA_PARAM;
                params.intra_qp = v[0];
                params.intra_period = v[1];
                params.repeat_headers = v[2];
            }
            ReconfDemoMode::RateControl => {
                params.enable_option = CHANGE_PARAM_RC;
                params.hvs_qp_enable = v[0];
                params.hvs_qp_scale = v[1];
                params.vbv_buffer_size = v[2];
                params.mb_level_rc_enable = v[3];
                params.filler_enable = v[4];
            }
            ReconfDemoMode::MinMaxQp => {
                params.enable_option = CHANGE_PARAM_RC_MIN_MAX_QP;
                params.min_qp_i = v[0];
                params.max_qp_i = v[1];
                params.max_delta_qp = v[2];
                params.min_qp_p = v[3];
                params.min_qp_b = v[4];
                params.max_qp_p = v[5];
                params.max_qp_b = v[6];
            }
            ReconfDemoMode::Off | ReconfDemoMode::LongTermRef => return None,
        }

        log::debug!(
            "frame {}: reconfiguring {:?} with {:?}",
            frame_num,
            self.mode,
            v
        );
        self.next += 1;
        Some(ReconfAction::ChangeParams)
    }
}
