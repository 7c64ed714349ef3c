// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::ColorDescription;
use crate::Resolution;

/// Progress of a mid-stream resolution change.
///
/// The running session is drained first, then closed, and a new one is
/// opened for the frames that waited in the queue meanwhile.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SeqChangeState {
    #[default]
    Normal,
    /// End of stream written to the old session, its packets still coming.
    Draining,
    /// The old session is done and being replaced.
    Reinitializing,
}

impl SeqChangeState {
    pub fn can_transition_to(self, to: SeqChangeState) -> bool {
        use SeqChangeState::*;

        matches!(
            (self, to),
            (Normal, Draining) | (Draining, Reinitializing) | (Reinitializing, Normal)
        )
    }

    pub fn transition(&mut self, to: SeqChangeState) -> EncodeResult<()> {
        if !self.can_transition_to(to) {
            return Err(EncodeError::InvalidSeqChange { from: *self, to });
        }

        log::debug!("sequence change {:?} -> {:?}", self, to);
        *self = to;
        Ok(())
    }

    pub fn is_normal(&self) -> bool {
        *self == SeqChangeState::Normal
    }
}

/// Picture properties a session is opened for. A frame that does not match
/// the running session starts a sequence change.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionFormat {
    pub resolution: Resolution,
    pub color: ColorDescription,
}
