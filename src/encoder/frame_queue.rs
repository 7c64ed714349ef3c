// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

/// Frames waiting for the device, oldest first.
///
/// The head is only popped once the device took it, so a frame that met
/// backpressure is retried before anything sent after it.
#[derive(Debug)]
pub struct FrameQueue<T> {
    frames: VecDeque<T>,
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_back(&mut self, frame: T) {
        self.frames.push_back(frame);
        log::trace!("frame queued, {} waiting", self.frames.len());
    }

    /// Puts a frame the device turned down back at the head.
    pub fn push_front(&mut self, frame: T) {
        self.frames.push_front(frame);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.frames.front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_requeue() {
        let mut queue = FrameQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        assert_eq!(queue.front(), Some(&1));

        let head = queue.pop_front().unwrap();
        queue.push_back(3);
        queue.push_front(head);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), Some(3));
        assert!(queue.is_empty());
    }
}
