// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode session adapter.
//!
//! Packets are written to the device as they come, with three twists:
//!
//! * out of band parameter sets are inserted ahead of random access pictures
//!   when the [`HeaderCache`] asks for it,
//! * packets made only of SEI units are held back and written together with
//!   the next packet, since the device wants SEI next to slice data,
//! * a packet the device did not take in full stays in flight and is finished
//!   by resubmitting it.
//!
//! Decoded pictures are read into buffers from a bounded [`FramePool`].

use crate::backend::BlockingMode;
use crate::backend::DecoderSession;
use crate::backend::DeviceError;
use crate::backend::DeviceType;
use crate::backend::FrameRead;
use crate::backend::PacketWrite;
use crate::backend::SessionConfig;
use crate::backend::SessionInfo;
use crate::codec::sei;
use crate::config::DecoderConfig;
use crate::decoder::header_cache::HeaderCache;
use crate::decoder::i420_layout;
use crate::decoder::Crop;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodedFrame;
use crate::decoder::DecoderState;
use crate::decoder::SubmitStatus;
use crate::frame_pool::FramePool;
use crate::frame_pool::PooledBuffer;
use crate::CompressedPacket;
use crate::PictureType;
use crate::PixelFormat;
use crate::Resolution;

/// Input unit of 512-aligned sessions.
const PACKET_ALIGNMENT: usize = 512;

/// A write the device did not fully take, and the packet it came from.
struct InFlightPacket {
    write: PacketWrite,
    pts: Option<i64>,
    size: usize,
}

impl InFlightPacket {
    fn is_from(&self, packet: &CompressedPacket) -> bool {
        self.pts == packet.pts && self.size == packet.data.len()
    }
}

pub struct XcoderDecoder<S: DecoderSession> {
    session: S,
    config: DecoderConfig,
    info: SessionInfo,
    open: bool,

    state: DecoderState,
    /// State to go back to when leaving `Flushing`.
    resume_state: DecoderState,

    header_cache: HeaderCache,
    pool: FramePool,

    /// Bytes waiting to go out ahead of the next packet.
    carry: Vec<u8>,
    /// SEI-only packets waiting for slice data.
    lone_sei: Vec<u8>,
    /// Write the device has not fully taken yet.
    in_flight: Option<InFlightPacket>,
    /// Running input offset.
    offset: u64,

    /// Resolution last reported by the device, or the configured one.
    resolution: Resolution,
    active: Option<Resolution>,
    current_pts: i64,
    last_pkt_pos: Option<u64>,
    last_pkt_duration: i64,
}

impl<S: DecoderSession> XcoderDecoder<S> {
    /// Validates `config` and opens a decode session on `session`.
    pub fn new(mut session: S, config: DecoderConfig) -> DecodeResult<Self> {
        config.validate()?;

        let info = match session.open(&Self::session_config(&config)) {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to open decoder ({}), resource unavailable", e);
                if let Err(e) = session.close(false) {
                    log::debug!("closing unopened decoder session: {}", e);
                }
                return Err(e.into());
            }
        };
        log::info!(
            "decoder {} index {} (inst: {}) opened",
            info.device_name,
            info.hw_index,
            info.session_id
        );

        Ok(Self {
            session,
            info,
            open: true,
            state: DecoderState::Idle,
            resume_state: DecoderState::Idle,
            header_cache: HeaderCache::new(config.codec),
            pool: FramePool::new(config.output_buffers),
            carry: Vec::new(),
            lone_sei: Vec::new(),
            in_flight: None,
            offset: 0,
            resolution: config.resolution,
            active: None,
            current_pts: 0,
            last_pkt_pos: None,
            last_pkt_duration: 0,
            config,
        })
    }

    fn session_config(config: &DecoderConfig) -> SessionConfig {
        let mut session = SessionConfig::new(DeviceType::Decoder, config.codec, config.resolution);
        session.selector = config.device.selector.clone();
        session.hw_index = config.device.hw_index;
        session.io_size = config.device.io_size;
        session
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    /// Resolution of the stream as last reported by the device.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn is_flushing(&self) -> bool {
        self.state == DecoderState::Flushing
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    fn transition(&mut self, to: DecoderState) -> DecodeResult<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(DecodeError::InvalidState {
                from: self.state,
                to,
            });
        }

        log::debug!("decoder state {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Replaces the out of band parameter sets.
    pub fn set_extradata(&mut self, extradata: Vec<u8>) {
        if extradata != self.config.extradata {
            log::debug!("new extradata of {} bytes", extradata.len());
            self.header_cache.invalidate();
            self.config.extradata = extradata;
        }
    }

    /// Builds the write for a new packet. Returns `None` when the packet was
    /// only SEI and has been kept for later.
    fn prepare(&mut self, packet: &CompressedPacket) -> DecodeResult<Option<PacketWrite>> {
        let codec = self.config.codec;

        if !self.config.extradata.is_empty()
            && self
                .header_cache
                .should_prepend(&packet.data, &self.config.extradata)
        {
            let limit = self.info.io_size() as usize * 2;
            if self.config.extradata.len() > limit {
                log::error!(
                    "extradata of {} bytes exceeds the {} bytes supported, not inserted",
                    self.config.extradata.len(),
                    limit
                );
            } else {
                log::debug!("inserting {} bytes of extradata", self.config.extradata.len());
                self.carry.extend_from_slice(&self.config.extradata);
            }
        }

        if sei::is_sei_only(codec, &packet.data) {
            log::trace!("lone SEI packet of {} bytes saved", packet.data.len());
            self.lone_sei.extend_from_slice(&packet.data);
            return Ok(None);
        }

        let mut data = std::mem::take(&mut self.carry);
        let carried = data.len();
        if !self.lone_sei.is_empty() {
            log::trace!("sending {} bytes of saved SEI", self.lone_sei.len());
            data.append(&mut self.lone_sei);
        }
        data.extend_from_slice(&packet.data);

        let user_data_sei = if self.config.user_data_sei_passthru {
            match sei::find_user_data_unregistered(codec, &data) {
                Ok(found) => found.map(|udu| {
                    log::trace!(
                        "user data SEI of {} bytes (no slice: {})",
                        udu.payload.len(),
                        udu.no_slice
                    );
                    udu.payload
                }),
                Err(e) => {
                    // The saved SEI and the packet go, what was carried
                    // before them goes out with the next packet.
                    log::error!(
                        "dropping {} bytes with a corrupt user data SEI: {}",
                        data.len() - carried,
                        e
                    );
                    data.truncate(carried);
                    self.carry = data;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let end_of_stream = packet.is_end_of_stream();
        let aligned = self.info.packet_512_aligned;
        if aligned && !end_of_stream {
            let send = data.len() / PACKET_ALIGNMENT * PACKET_ALIGNMENT;
            self.carry = data.split_off(send);
        }

        let pos = self.offset;
        self.offset += if aligned {
            data.len() as u64
        } else {
            packet.data.len() as u64
        };

        Ok(Some(PacketWrite {
            data,
            pts: packet.pts,
            dts: packet.dts,
            pos,
            start_of_stream: false,
            end_of_stream: false,
            user_data_sei,
        }))
    }

    /// Sends `packet` to the device. An empty packet starts draining.
    ///
    /// After [`SubmitStatus::Partial`] or [`DecodeError::TryAgain`] the same
    /// packet has to be submitted again.
    pub fn submit(&mut self, packet: &CompressedPacket) -> DecodeResult<SubmitStatus> {
        match self.state {
            DecoderState::Flushing => {
                log::error!(
                    "decoder is flushing and cannot accept new buffers until all output buffers \
                     have been released"
                );
                return Err(DecodeError::Busy);
            }
            DecoderState::Eos => {
                log::debug!("decoder is draining, eos");
                return Err(DecodeError::EndOfStream);
            }
            DecoderState::Draining if packet.is_end_of_stream() => {
                return Err(DecodeError::TryAgain);
            }
            _ => (),
        }

        let mut write = match self.in_flight.take() {
            Some(pending) if !packet.is_end_of_stream() && !pending.is_from(packet) => {
                log::error!(
                    "packet pts={:?} submitted while {} bytes of pts={:?} are pending",
                    packet.pts,
                    pending.write.data.len(),
                    pending.pts
                );
                let pending_pts = pending.pts;
                self.in_flight = Some(pending);
                return Err(DecodeError::PacketPending {
                    pending: pending_pts,
                    submitted: packet.pts,
                });
            }
            Some(pending) => pending.write,
            None => match self.prepare(packet)? {
                Some(write) => {
                    if !packet.is_end_of_stream() {
                        self.last_pkt_pos = packet.pos;
                        self.last_pkt_duration = packet.duration;
                    }
                    write
                }
                None => return Ok(SubmitStatus::Buffered(packet.data.len())),
            },
        };

        if self.state == DecoderState::Idle {
            write.start_of_stream = true;
            self.transition(DecoderState::Started)?;
        }

        log::debug!(
            "submit: packet size {}, in flight {}, carry {}",
            packet.data.len(),
            write.data.len(),
            self.carry.len()
        );

        if packet.is_end_of_stream() {
            return self.send_end_of_stream(write);
        }

        if write.data.is_empty() {
            return Ok(SubmitStatus::Buffered(packet.data.len()));
        }

        match self.session.write_packet(&write) {
            Ok(0) => {
                log::debug!("device took nothing, packet kept");
                self.in_flight = Some(InFlightPacket {
                    write,
                    pts: packet.pts,
                    size: packet.data.len(),
                });
                Err(DecodeError::TryAgain)
            }
            Ok(sent) if sent < write.data.len() => {
                write.data.drain(..sent);
                write.start_of_stream = false;
                let remaining = write.data.len();
                log::debug!("partial write: {} sent, {} remaining", sent, remaining);
                self.in_flight = Some(InFlightPacket {
                    write,
                    pts: packet.pts,
                    size: packet.data.len(),
                });
                Ok(SubmitStatus::Partial { sent, remaining })
            }
            Ok(sent) => {
                log::debug!(
                    "sent pts={:?} dts={:?} pos={} size={}",
                    write.pts,
                    write.dts,
                    write.pos,
                    sent
                );
                Ok(SubmitStatus::Sent(sent))
            }
            Err(e) => self.write_failed(e),
        }
    }

    fn send_end_of_stream(&mut self, mut write: PacketWrite) -> DecodeResult<SubmitStatus> {
        log::debug!("sending end of stream");
        write.end_of_stream = true;

        if let Err(e) = self.session.write_packet(&write) {
            return self.write_failed(e);
        }

        self.transition(DecoderState::Draining)?;
        if let Err(e) = self.session.flush() {
            log::warn!("decoder flush failed: {}", e);
        }
        Ok(SubmitStatus::Drained)
    }

    fn write_failed(&mut self, e: DeviceError) -> DecodeResult<SubmitStatus> {
        log::error!("failed to send compressed packet: {}", e);
        if e == DeviceError::VpuRecovery {
            self.reset()?;
            return Err(DecodeError::TryAgain);
        }
        Err(DecodeError::EndOfStream)
    }

    fn frame_buffer_size(&self) -> usize {
        let resolution = self.active.unwrap_or(self.resolution);
        let padded = Resolution::new(
            crate::align_up(resolution.width, 16),
            crate::align_up(resolution.height, self.config.codec.alignment()),
        );
        i420_layout(padded, 2).2
    }

    fn mark_end_of_stream(&mut self) -> DecodeResult<()> {
        if self.state == DecoderState::Draining {
            self.transition(DecoderState::Eos)?;
        }
        Ok(())
    }

    /// Reads the next decoded picture.
    pub fn receive(&mut self, mode: BlockingMode) -> DecodeResult<DecodedFrame> {
        if self.state == DecoderState::Eos {
            return Err(DecodeError::EndOfStream);
        }

        if self.state == DecoderState::Flushing {
            if self.pool.num_free() == 0 {
                return Err(DecodeError::Busy);
            }
            self.transition(self.resume_state)?;
        }

        let Some(mut buffer) = self.pool.alloc(self.frame_buffer_size()) else {
            log::warn!(
                "all {} output buffers are in use, flushing",
                self.pool.capacity()
            );
            self.resume_state = self.state;
            self.transition(DecoderState::Flushing)?;
            return Err(DecodeError::Busy);
        };

        let mut read = FrameRead {
            data: std::mem::take(&mut *buffer),
            ..Default::default()
        };
        let result = self.session.read_frame(&mut read, mode);
        *buffer = std::mem::take(&mut read.data);

        match result {
            Ok(0) => {
                if read.end_of_stream {
                    self.mark_end_of_stream()?;
                }
                Err(DecodeError::TryAgain)
            }
            Ok(size) => self.retrieve(buffer, read, size),
            Err(DeviceError::VpuRecovery) => {
                log::warn!("VPU recovery, the decoder needs a reset");
                Err(DecodeError::RecoveryRequired)
            }
            Err(e) => {
                log::error!("failed to get output buffer: {}", e);
                Err(DecodeError::EndOfStream)
            }
        }
    }

    fn retrieve(
        &mut self,
        buffer: PooledBuffer,
        read: FrameRead,
        size: usize,
    ) -> DecodeResult<DecodedFrame> {
        log::debug!(
            "got output buffer pts={:?} eos={} size={}",
            read.pts,
            read.end_of_stream,
            size
        );

        if read.end_of_stream {
            self.mark_end_of_stream()?;
        }

        let resolution = Resolution::new(read.width, read.height);
        if resolution != self.resolution {
            // A coded size padded past the display size is not a change.
            let cropped_width = read.crop_right.saturating_sub(read.crop_left);
            let cropped_height = read.crop_bottom.saturating_sub(read.crop_top);
            if cropped_width != self.resolution.width || cropped_height != self.resolution.height
            {
                log::warn!("resolution changed: {} to {}", self.resolution, resolution);
            }
            self.resolution = resolution;
        }
        self.active = Some(resolution);

        let bit_depth_factor = read.bit_depth_factor.max(1);
        let (offsets, strides, frame_size) = i420_layout(resolution, bit_depth_factor);
        if resolution.is_empty() || size < frame_size || buffer.len() < frame_size {
            log::error!("packet too small ({})", size);
            return Err(DecodeError::TruncatedFrame { size, resolution });
        }

        let (picture_type, key_frame) = match read.picture_type {
            PictureType::I | PictureType::Idr => (PictureType::I, true),
            PictureType::P => (PictureType::P, false),
            PictureType::B => (PictureType::B, false),
            PictureType::None => (PictureType::None, false),
        };

        let side_data = |at: Option<(usize, usize)>| {
            at.filter(|&(offset, len)| offset > 0 && len > 0)
                .and_then(|(offset, len)| buffer.get(offset..offset + len))
                .map(<[u8]>::to_vec)
        };

        let mut user_data_sei = Vec::new();
        if self.config.user_data_sei_passthru {
            user_data_sei.extend(side_data(read.user_data_sei_at));
        }
        let closed_caption = side_data(read.closed_caption_at);
        user_data_sei.extend(read.user_data_sei);

        let pts = match read.pts {
            Some(pts) => pts,
            None => {
                let duration = if self.last_pkt_duration > 0 {
                    self.last_pkt_duration
                } else {
                    self.config.frame_duration
                };
                self.current_pts += duration;
                self.current_pts
            }
        };

        let crop = Crop {
            top: read.crop_top,
            bottom: read.height.saturating_sub(read.crop_bottom),
            left: read.crop_left,
            right: read.width.saturating_sub(read.crop_right),
        };

        log::debug!(
            "retrieved frame {} pts={} pkt_pos={:?} crop={:?}",
            resolution,
            pts,
            self.last_pkt_pos,
            crop
        );

        Ok(DecodedFrame {
            buffer,
            resolution,
            format: PixelFormat::from_bit_depth_factor(bit_depth_factor),
            offsets,
            strides,
            picture_type,
            key_frame,
            crop,
            pts,
            pkt_dts: read.pts,
            pkt_pos: self.last_pkt_pos,
            pkt_duration: self.last_pkt_duration,
            closed_caption,
            user_data_sei,
        })
    }

    /// Leaves the draining, end of stream and flushing states so that a new
    /// stream can be decoded.
    pub fn flush(&mut self) -> DecodeResult<()> {
        let never_started = self.state == DecoderState::Idle
            || (self.state == DecoderState::Flushing && self.resume_state == DecoderState::Idle);
        let to = if never_started {
            DecoderState::Idle
        } else {
            DecoderState::Started
        };
        self.transition(to)
    }

    /// Closes the session and opens a fresh one with the same configuration.
    /// Buffered input is dropped.
    pub fn reset(&mut self) -> DecodeResult<()> {
        log::warn!("decoder reset");
        self.close();

        self.in_flight = None;
        self.carry.clear();
        self.lone_sei.clear();
        self.offset = 0;
        self.header_cache.invalidate();
        self.transition(DecoderState::Idle)?;

        self.info = self.session.open(&Self::session_config(&self.config))?;
        self.open = true;
        log::info!(
            "decoder {} index {} (inst: {}) reopened",
            self.info.device_name,
            self.info.hw_index,
            self.info.session_id
        );
        Ok(())
    }

    /// Closes the session. Failures are logged only.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        if let Err(e) = self.session.close(self.state == DecoderState::Eos) {
            log::error!("failed to close decode session: {}", e);
        }
    }
}

impl<S: DecoderSession> Drop for XcoderDecoder<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::lock;
    use crate::backend::dummy::DummyHandle;
    use crate::backend::dummy::DummySession;
    use crate::backend::dummy::FrameScript;
    use crate::backend::dummy::WriteOutcome;
    use crate::Codec;

    const SEI_ONLY: [u8; 10] = [0x00, 0x00, 0x00, 0x01, 0x06, 0x05, 0x01, 0xaa, 0x80, 0x00];
    const IDR: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21];
    const P_SLICE: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9a, 0x24, 0x6c];
    const PARAMS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e];

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn decoder(config: DecoderConfig) -> (XcoderDecoder<DummySession>, DummyHandle) {
        init();
        let session = DummySession::new();
        let handle = session.handle();
        (XcoderDecoder::new(session, config).unwrap(), handle)
    }

    fn config() -> DecoderConfig {
        DecoderConfig::new(Codec::H264, Resolution::new(64, 32))
    }

    fn packet(data: &[u8], pts: i64) -> CompressedPacket {
        CompressedPacket::new(data.to_vec(), Some(pts))
    }

    fn scripted_frame(width: u32, height: u32, pts: Option<i64>) -> FrameRead {
        let (_, _, size) = i420_layout(Resolution::new(width, height), 1);
        FrameRead {
            data: vec![0x10; size],
            width,
            height,
            crop_right: width,
            crop_bottom: height,
            picture_type: PictureType::Idr,
            pts,
            ..Default::default()
        }
    }

    #[test]
    fn sei_only_packet_is_held_back() {
        let (mut dec, handle) = decoder(config());

        assert_eq!(dec.submit(&packet(&SEI_ONLY, 0)).unwrap(), SubmitStatus::Buffered(10));
        assert_eq!(lock(&handle).write_attempts, 0);

        assert_eq!(dec.submit(&packet(&IDR, 0)).unwrap(), SubmitStatus::Sent(18));
        let state = lock(&handle);
        assert_eq!(state.packet_writes.len(), 1);
        let write = &state.packet_writes[0];
        assert!(write.start_of_stream);
        assert_eq!(&write.data[..10], &SEI_ONLY);
        assert_eq!(&write.data[10..], &IDR);
    }

    #[test]
    fn header_prepended_before_idr() {
        let mut config = config();
        config.extradata = PARAMS.to_vec();
        let (mut dec, handle) = decoder(config);

        dec.submit(&packet(&IDR, 0)).unwrap();
        dec.submit(&packet(&P_SLICE, 1)).unwrap();
        dec.submit(&packet(&IDR, 2)).unwrap();

        let state = lock(&handle);
        let writes: Vec<&[u8]> = state.packet_writes.iter().map(|w| &w.data[..]).collect();
        assert_eq!(writes[0], [&PARAMS[..], &IDR[..]].concat());
        assert_eq!(writes[1], &P_SLICE);
        assert_eq!(writes[2], &IDR);
        assert_eq!(state.packet_writes[1].pos, 8);
    }

    #[test]
    fn new_extradata_is_inserted_again() {
        let mut config = config();
        config.extradata = PARAMS.to_vec();
        let (mut dec, handle) = decoder(config);

        dec.submit(&packet(&IDR, 0)).unwrap();
        let new_params = [0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x28];
        dec.set_extradata(new_params.to_vec());
        dec.submit(&packet(&IDR, 1)).unwrap();

        let state = lock(&handle);
        assert_eq!(state.packet_writes[1].data, [&new_params[..], &IDR[..]].concat());
    }

    #[test]
    fn rejected_and_partial_writes_keep_the_packet() {
        let (mut dec, handle) = decoder(config());
        lock(&handle)
            .write_results
            .extend([WriteOutcome::Reject, WriteOutcome::Partial(3)]);

        let idr = packet(&IDR, 0);
        assert!(matches!(dec.submit(&idr), Err(DecodeError::TryAgain)));
        assert_eq!(
            dec.submit(&idr).unwrap(),
            SubmitStatus::Partial {
                sent: 3,
                remaining: 5
            }
        );
        assert_eq!(dec.submit(&idr).unwrap(), SubmitStatus::Sent(5));

        let state = lock(&handle);
        assert_eq!(state.packet_writes.len(), 2);
        assert!(state.packet_writes[0].start_of_stream);
        assert!(!state.packet_writes[1].start_of_stream);
        let sent: Vec<u8> = state.packet_writes.iter().flat_map(|w| w.data.clone()).collect();
        assert_eq!(sent, IDR);
    }

    #[test]
    fn different_packet_while_pending_is_refused() {
        let (mut dec, handle) = decoder(config());
        lock(&handle).write_results.push_back(WriteOutcome::Reject);

        let idr = packet(&IDR, 0);
        assert!(matches!(dec.submit(&idr), Err(DecodeError::TryAgain)));
        assert!(matches!(
            dec.submit(&packet(&P_SLICE, 1)),
            Err(DecodeError::PacketPending {
                pending: Some(0),
                submitted: Some(1)
            })
        ));
        assert_eq!(dec.submit(&idr).unwrap(), SubmitStatus::Sent(8));

        let state = lock(&handle);
        assert_eq!(state.packet_writes.len(), 1);
        assert_eq!(state.packet_writes[0].data, IDR);
    }

    #[test]
    fn aligned_sessions_carry_the_tail() {
        let (mut dec, handle) = decoder(config());
        dec.info.packet_512_aligned = true;

        let mut big = IDR.to_vec();
        big.resize(700, 0x11);
        assert_eq!(dec.submit(&packet(&big, 0)).unwrap(), SubmitStatus::Sent(512));
        assert_eq!(dec.submit(&CompressedPacket::end_of_stream()).unwrap(), SubmitStatus::Drained);

        let state = lock(&handle);
        assert_eq!(state.packet_writes[0].data.len(), 512);
        assert_eq!(state.packet_writes[1].data.len(), 188);
        assert!(state.packet_writes[1].end_of_stream);
        assert_eq!(state.packet_writes[1].pos, 512);
        assert_eq!(state.flushes, 1);
        drop(state);
        assert_eq!(dec.state(), DecoderState::Draining);
    }

    #[test]
    fn vpu_recovery_on_submit_resets() {
        let (mut dec, handle) = decoder(config());
        lock(&handle)
            .write_results
            .push_back(WriteOutcome::Fail(DeviceError::VpuRecovery));

        assert!(matches!(dec.submit(&packet(&IDR, 0)), Err(DecodeError::TryAgain)));
        {
            let state = lock(&handle);
            assert_eq!(state.opens.len(), 2);
            assert_eq!(state.closes.len(), 1);
        }
        assert_eq!(dec.state(), DecoderState::Idle);

        dec.submit(&packet(&IDR, 0)).unwrap();
        assert!(lock(&handle).packet_writes[0].start_of_stream);
    }

    #[test]
    fn other_write_errors_end_the_stream() {
        let (mut dec, handle) = decoder(config());
        lock(&handle)
            .write_results
            .push_back(WriteOutcome::Fail(DeviceError::Failure(-1)));
        assert!(matches!(dec.submit(&packet(&IDR, 0)), Err(DecodeError::EndOfStream)));
    }

    #[test]
    fn receive_frame_with_side_data() {
        let mut config = config();
        config.user_data_sei_passthru = true;
        let (mut dec, handle) = decoder(config);

        let mut frame = scripted_frame(64, 32, None);
        frame.data[100..103].copy_from_slice(&[0xfc, 0x80, 0x80]);
        frame.data[200..204].copy_from_slice(&[1, 2, 3, 4]);
        frame.closed_caption_at = Some((100, 3));
        frame.user_data_sei_at = Some((200, 4));
        frame.user_data_sei = Some(vec![9, 9]);
        lock(&handle).frame_reads.extend([
            FrameScript::Empty {
                end_of_stream: false,
            },
            FrameScript::Frame(frame),
        ]);

        let mut p = packet(&IDR, 0);
        p.pts = None;
        p.duration = 40;
        p.pos = Some(1234);
        dec.submit(&p).unwrap();

        assert!(matches!(
            dec.receive(BlockingMode::NonBlocking),
            Err(DecodeError::TryAgain)
        ));
        let frame = dec.receive(BlockingMode::NonBlocking).unwrap();
        assert_eq!(frame.picture_type, PictureType::I);
        assert!(frame.key_frame);
        assert_eq!(frame.pts, 40);
        assert_eq!(frame.pkt_dts, None);
        assert_eq!(frame.pkt_pos, Some(1234));
        assert_eq!(frame.closed_caption.as_deref(), Some(&[0xfc, 0x80, 0x80][..]));
        assert_eq!(frame.user_data_sei, vec![vec![1, 2, 3, 4], vec![9, 9]]);
        assert_eq!(
            frame.crop,
            Crop {
                top: 0,
                bottom: 0,
                left: 0,
                right: 0
            }
        );
        assert_eq!(frame.plane(0).len(), 64 * 32);
        assert_eq!(frame.plane(1).len(), 32 * 16);
    }

    #[test]
    fn user_data_sei_passthrough_from_packets() {
        let mut config = config();
        config.user_data_sei_passthru = true;
        let (mut dec, handle) = decoder(config);

        dec.submit(&packet(&SEI_ONLY, 0)).unwrap();
        dec.submit(&packet(&IDR, 0)).unwrap();
        assert_eq!(lock(&handle).packet_writes[0].user_data_sei, Some(vec![0xaa]));
    }

    #[test]
    fn corrupt_user_data_sei_is_reported_once() {
        let mut config = config();
        config.user_data_sei_passthru = true;
        let (mut dec, handle) = decoder(config);

        // The SEI declares 300 payload bytes but carries two.
        let corrupt = [0, 0, 0, 1, 0x06, 0x05, 0xff, 0x2d, 0xaa, 0x80];
        assert_eq!(dec.submit(&packet(&corrupt, 0)).unwrap(), SubmitStatus::Buffered(10));
        assert!(matches!(
            dec.submit(&packet(&IDR, 0)),
            Err(DecodeError::CorruptSei(_))
        ));
        assert_eq!(dec.submit(&packet(&P_SLICE, 1)).unwrap(), SubmitStatus::Sent(8));

        let state = lock(&handle);
        assert_eq!(state.packet_writes.len(), 1);
        assert_eq!(state.packet_writes[0].data, P_SLICE);
        assert_eq!(state.packet_writes[0].user_data_sei, None);
    }

    #[test]
    fn pool_exhaustion_flushes() {
        let mut config = config();
        config.output_buffers = 1;
        let (mut dec, handle) = decoder(config);
        lock(&handle).frame_reads.extend([
            FrameScript::Frame(scripted_frame(64, 32, Some(0))),
            FrameScript::Frame(scripted_frame(64, 32, Some(1))),
        ]);

        dec.submit(&packet(&IDR, 0)).unwrap();
        let held = dec.receive(BlockingMode::Blocking).unwrap();
        assert!(matches!(dec.receive(BlockingMode::Blocking), Err(DecodeError::Busy)));
        assert!(dec.is_flushing());
        assert!(matches!(dec.submit(&packet(&P_SLICE, 1)), Err(DecodeError::Busy)));

        drop(held);
        let frame = dec.receive(BlockingMode::Blocking).unwrap();
        assert_eq!(frame.pts, 1);
        assert_eq!(dec.state(), DecoderState::Started);
    }

    #[test]
    fn drain_to_end_of_stream() {
        let (mut dec, handle) = decoder(config());
        let mut last = scripted_frame(64, 32, Some(5));
        last.end_of_stream = true;
        lock(&handle).frame_reads.push_back(FrameScript::Frame(last));

        dec.submit(&packet(&IDR, 5)).unwrap();
        dec.submit(&CompressedPacket::end_of_stream()).unwrap();
        assert!(matches!(
            dec.submit(&CompressedPacket::end_of_stream()),
            Err(DecodeError::TryAgain)
        ));

        let frame = dec.receive(BlockingMode::Blocking).unwrap();
        assert_eq!(frame.pts, 5);
        assert_eq!(dec.state(), DecoderState::Eos);
        assert!(matches!(
            dec.receive(BlockingMode::Blocking),
            Err(DecodeError::EndOfStream)
        ));
        assert!(matches!(dec.submit(&packet(&IDR, 6)), Err(DecodeError::EndOfStream)));

        dec.flush().unwrap();
        assert_eq!(dec.state(), DecoderState::Started);
    }

    #[test]
    fn resolution_change_and_recovery_on_receive() {
        let (mut dec, handle) = decoder(config());
        let mut cropped = scripted_frame(64, 48, Some(0));
        cropped.crop_bottom = 40;
        cropped.crop_right = 60;
        lock(&handle).frame_reads.extend([
            FrameScript::Frame(cropped),
            FrameScript::Fail(DeviceError::VpuRecovery),
            FrameScript::Fail(DeviceError::Failure(-5)),
        ]);

        let frame = dec.receive(BlockingMode::Blocking).unwrap();
        assert_eq!(dec.resolution(), Resolution::new(64, 48));
        assert_eq!(frame.crop.bottom, 8);
        assert_eq!(frame.crop.right, 4);

        assert!(matches!(
            dec.receive(BlockingMode::Blocking),
            Err(DecodeError::RecoveryRequired)
        ));
        assert!(matches!(
            dec.receive(BlockingMode::Blocking),
            Err(DecodeError::EndOfStream)
        ));
    }

    #[test]
    fn close_on_drop() {
        let (dec, handle) = decoder(config());
        drop(dec);
        assert_eq!(lock(&handle).closes, vec![false]);
    }
}
