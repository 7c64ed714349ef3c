// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the adapters
//! run so we can test them in isolation.
//!
//! A [`DummySession`] records every call it receives and replays scripted
//! results. The state lives behind a shared [`DummyHandle`] so that a test can
//! keep inspecting and scripting the session after handing it to an adapter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::backend::BlockingMode;
use crate::backend::DecoderSession;
use crate::backend::DeviceError;
use crate::backend::DeviceResult;
use crate::backend::EncoderSession;
use crate::backend::FrameRead;
use crate::backend::FrameWrite;
use crate::backend::PacketRead;
use crate::backend::PacketWrite;
use crate::backend::SessionConfig;
use crate::backend::SessionInfo;
use crate::backend::XcoderSession;
use crate::backend::PACKET_METADATA_SIZE;

/// Outcome of the next write call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Accept,
    /// Accept at most this many bytes.
    Partial(usize),
    /// Accept nothing.
    Reject,
    Fail(DeviceError),
}

/// Outcome of the next frame read.
#[derive(Clone, Debug)]
pub enum FrameScript {
    /// No picture yet, optionally flagging the end of the stream.
    Empty { end_of_stream: bool },
    /// A picture. `data` is copied into the caller's buffer.
    Frame(FrameRead),
    Fail(DeviceError),
}

#[derive(Debug, Default)]
pub struct DummyState {
    pub info: SessionInfo,
    pub open_results: VecDeque<DeviceResult<()>>,
    pub write_results: VecDeque<WriteOutcome>,
    pub frame_reads: VecDeque<FrameScript>,
    pub packet_reads: VecDeque<DeviceResult<PacketRead>>,
    /// Answer every accepted frame with a packet carrying its pts, preceded
    /// by `header` right after open.
    pub echo_packets: bool,
    pub header: Vec<u8>,

    pub is_open: bool,
    pub opens: Vec<SessionConfig>,
    pub closes: Vec<bool>,
    pub flushes: usize,
    pub write_attempts: usize,
    pub packet_writes: Vec<PacketWrite>,
    pub frame_writes: Vec<FrameWrite>,
    eos_signalled: bool,
    echoed: usize,
}

impl DummyState {
    fn next_write(&mut self, len: usize) -> DeviceResult<usize> {
        self.write_attempts += 1;
        if !self.is_open {
            return Err(DeviceError::InvalidSession);
        }

        match self.write_results.pop_front().unwrap_or(WriteOutcome::Accept) {
            WriteOutcome::Accept => Ok(len),
            WriteOutcome::Partial(n) => Ok(n.min(len)),
            WriteOutcome::Reject => Ok(0),
            WriteOutcome::Fail(e) => Err(e),
        }
    }

    fn echo(&mut self, frame: &FrameWrite) {
        if frame.end_of_stream {
            self.eos_signalled = true;
            return;
        }

        let mut data = vec![0u8; PACKET_METADATA_SIZE];
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x26, 0x01]);
        data.extend_from_slice(&frame.pts.to_le_bytes());
        let frame_type = if self.echoed == 0 || frame.force_key_frame { 0 } else { 1 };
        self.echoed += 1;
        self.packet_reads.push_back(Ok(PacketRead {
            data,
            frame_type,
            pts: frame.pts,
            end_of_stream: false,
        }));
    }
}

pub type DummyHandle = Arc<Mutex<DummyState>>;

/// Locks `handle`, ignoring poisoning from a panicking test thread.
pub fn lock(handle: &DummyHandle) -> MutexGuard<'_, DummyState> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted session usable both as a decoder and as an encoder.
#[derive(Debug, Default)]
pub struct DummySession {
    state: DummyHandle,
}

impl DummySession {
    pub fn new() -> Self {
        Default::default()
    }

    /// A session whose encoder side answers every frame with a packet.
    pub fn echoing(header: &[u8]) -> Self {
        let session = Self::new();
        {
            let mut state = lock(&session.state);
            state.echo_packets = true;
            state.header = header.to_vec();
        }
        session
    }

    pub fn handle(&self) -> DummyHandle {
        Arc::clone(&self.state)
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        lock(&self.state)
    }
}

impl XcoderSession for DummySession {
    fn open(&mut self, config: &SessionConfig) -> DeviceResult<SessionInfo> {
        let mut state = self.state();
        state.opens.push(config.clone());
        state.open_results.pop_front().unwrap_or(Ok(()))?;

        state.is_open = true;
        state.eos_signalled = false;
        state.echoed = 0;
        if state.echo_packets {
            let mut data = vec![0u8; PACKET_METADATA_SIZE];
            data.extend_from_slice(&state.header);
            state.packet_reads.push_back(Ok(PacketRead {
                data,
                frame_type: 0,
                pts: 0,
                end_of_stream: false,
            }));
        }

        let mut info = state.info.clone();
        info.session_id = state.opens.len() as u32;
        Ok(info)
    }

    fn close(&mut self, eos: bool) -> DeviceResult<()> {
        let mut state = self.state();
        state.closes.push(eos);
        if !state.is_open {
            return Err(DeviceError::InvalidSession);
        }
        state.is_open = false;
        if state.echo_packets {
            state.packet_reads.clear();
        }
        Ok(())
    }

    fn flush(&mut self) -> DeviceResult<()> {
        let mut state = self.state();
        state.flushes += 1;
        state.eos_signalled = true;
        Ok(())
    }
}

impl DecoderSession for DummySession {
    fn write_packet(&mut self, packet: &PacketWrite) -> DeviceResult<usize> {
        let mut state = self.state();
        let sent = state.next_write(packet.data.len())?;
        if sent > 0 || packet.end_of_stream {
            let mut accepted = packet.clone();
            accepted.data.truncate(sent);
            state.packet_writes.push(accepted);
        }
        Ok(sent)
    }

    fn read_frame(&mut self, frame: &mut FrameRead, _: BlockingMode) -> DeviceResult<usize> {
        let mut state = self.state();
        if !state.is_open {
            return Err(DeviceError::InvalidSession);
        }

        match state.frame_reads.pop_front() {
            None => Ok(0),
            Some(FrameScript::Empty { end_of_stream }) => {
                frame.end_of_stream = end_of_stream;
                Ok(0)
            }
            Some(FrameScript::Frame(scripted)) => {
                let mut data = std::mem::take(&mut frame.data);
                let len = scripted.data.len();
                if data.len() < len {
                    data.resize(len, 0);
                }
                data[..len].copy_from_slice(&scripted.data);
                *frame = FrameRead { data, ..scripted };
                Ok(len)
            }
            Some(FrameScript::Fail(e)) => Err(e),
        }
    }
}

impl EncoderSession for DummySession {
    fn write_frame(&mut self, frame: &FrameWrite) -> DeviceResult<usize> {
        let mut state = self.state();
        let len = match &frame.planes {
            crate::backend::FramePlanes::ZeroCopy(planes) => planes.iter().map(|p| p.len()).sum(),
            crate::backend::FramePlanes::Copied { data, .. } => data.len(),
        } + frame.extra_data.len();

        // End of stream writes carry no picture but still have to be taken.
        let sent = state.next_write(len.max(1))?;
        if sent > 0 {
            state.frame_writes.push(frame.clone());
            if state.echo_packets {
                state.echo(frame);
            }
        }
        Ok(sent)
    }

    fn read_packet(&mut self, packet: &mut PacketRead) -> DeviceResult<usize> {
        let mut state = self.state();
        if !state.is_open {
            return Err(DeviceError::InvalidSession);
        }

        match state.packet_reads.pop_front() {
            Some(Ok(scripted)) => {
                let len = scripted.data.len();
                *packet = scripted;
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => {
                packet.data.clear();
                packet.end_of_stream = state.eos_signalled;
                Ok(0)
            }
        }
    }
}
