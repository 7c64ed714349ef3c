// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame writes on worker threads.
//!
//! A write moves the session into a task for a worker of the [`WritePool`].
//! The session comes back, with the outcome of the write, through the
//! [`PendingWrite`] returned by [`WritePool::dispatch`]. Since the session
//! itself travels with the task, a session never has more than one write in
//! flight.

use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::Context;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::backend::DeviceResult;
use crate::backend::EncoderSession;
use crate::backend::FrameWrite;
use crate::encoder::EncodeResult;

type Task = Box<dyn FnOnce() + Send>;

/// Outcome of a write that ran on a worker.
pub struct PendingWrite<S> {
    receiver: Receiver<(S, DeviceResult<usize>)>,
}

impl<S> PendingWrite<S> {
    /// Blocks until the write finished and hands the session back.
    pub fn wait(self) -> EncodeResult<(S, DeviceResult<usize>)> {
        Ok(self
            .receiver
            .recv()
            .map_err(|_| anyhow!("write worker exited with the session"))?)
    }
}

pub struct WritePool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WritePool {
    /// Starts `threads` workers sharing a queue of `depth` pending tasks.
    pub fn new(threads: usize, depth: usize) -> EncodeResult<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<Task>(depth.max(1));

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("xcoder-write-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .context("failed to spawn write worker")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        log::debug!("write pool of {} workers started", workers.len());
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Writes `frame` to `session` on a worker.
    pub fn dispatch<S>(&self, mut session: S, frame: FrameWrite) -> EncodeResult<PendingWrite<S>>
    where
        S: EncoderSession + Send + 'static,
    {
        let (done, receiver) = crossbeam_channel::bounded(1);
        let task: Task = Box::new(move || {
            let result = session.write_frame(&frame);
            log::trace!("threaded write of pts {} done: {:?}", frame.pts, result);
            // The encoder may be gone already, in which case the session is
            // dropped here.
            let _ = done.send((session, result));
        });

        self.sender
            .as_ref()
            .ok_or_else(|| anyhow!("write pool is shut down"))?
            .send(task)
            .map_err(|_| anyhow!("write pool is shut down"))?;

        Ok(PendingWrite { receiver })
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        // Disconnecting the queue stops the workers once it is empty.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("write worker panicked");
            }
        }
    }
}
