// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded pool of decoder output buffers.
//!
//! The device decodes into buffers it owns. A decoded frame borrows one of
//! them for as long as the caller keeps the frame alive, and dropping the frame
//! hands the buffer back. When every buffer is out the decoder has to stop
//! reading until the caller releases some.

use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

type FreeList = Mutex<VecDeque<Vec<u8>>>;

/// A buffer on loan from a [`FramePool`]. Returned to the pool on drop, unless
/// the pool is gone by then.
#[derive(Debug)]
pub struct PooledBuffer {
    inner: Vec<u8>,
    pool: Weak<FreeList>,
}

impl PooledBuffer {
    /// A buffer that does not belong to any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self {
            inner: data,
            pool: Weak::new(),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let buf = std::mem::take(&mut self.inner);
            pool.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(buf);
        }
    }
}

pub struct FramePool {
    capacity: usize,
    free: Arc<FreeList>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Vec::new()).collect();
        Self {
            capacity,
            free: Arc::new(Mutex::new(free)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Takes a free buffer and sizes it to `size` bytes. Returns `None` when
    /// every buffer is on loan.
    pub fn alloc(&self, size: usize) -> Option<PooledBuffer> {
        let mut buf = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()?;
        buf.clear();
        buf.resize(size, 0);

        Some(PooledBuffer {
            inner: buf,
            pool: Arc::downgrade(&self.free),
        })
    }
}
