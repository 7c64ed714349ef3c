// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode session adapter.
//!
//! Frames go to the device one write at a time. A frame the device does not
//! take waits in a [`FrameQueue`], and from then on the queue head is written
//! first, so frames reach the device in the order they were sent.
//!
//! The session is opened with the first frame, whose size and colour fix the
//! stream parameters. A later frame that does not match starts a sequence
//! change: end of stream is written to the running session, its packets are
//! drained, and a new session is opened for the frames that queued up in the
//! meantime.

#[cfg(feature = "threaded-write")]
use std::sync::Arc;

use anyhow::anyhow;

use crate::align_up;
use crate::backend::DeviceError;
use crate::backend::DeviceType;
use crate::backend::EncoderSession;
use crate::backend::FramePlanes;
use crate::backend::FrameWrite;
use crate::backend::PacketRead;
use crate::backend::SessionConfig;
use crate::backend::SessionInfo;
use crate::backend::PACKET_METADATA_SIZE;
use crate::codec::vui::build_vui;
use crate::config::check_dimensions;
use crate::config::EncoderConfig;
use crate::config::EncoderParams;
use crate::config::ReconfDemoMode;
use crate::encoder::frame_queue::FrameQueue;
use crate::encoder::layout::copy_planes;
use crate::encoder::layout::page_size;
use crate::encoder::layout::placement;
use crate::encoder::layout::HwLayout;
use crate::encoder::layout::Placement;
use crate::encoder::layout::ZeroCopyPolicy;
use crate::encoder::reconfig::ReconfAction;
use crate::encoder::reconfig::ReconfSchedule;
use crate::encoder::reorder::ReorderState;
use crate::encoder::roi::RoiMap;
use crate::encoder::seq_change::SeqChangeState;
use crate::encoder::seq_change::SessionFormat;
#[cfg(feature = "threaded-write")]
use crate::encoder::threaded::PendingWrite;
#[cfg(feature = "threaded-write")]
use crate::encoder::threaded::WritePool;
use crate::encoder::trailer::EncoderChangeParams;
use crate::encoder::trailer::ExtraDataBuilder;
use crate::encoder::trailer::CHANGE_PARAM_RC_TARGET_RATE;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderState;
use crate::encoder::RawFrame;
use crate::encoder::SendStatus;
use crate::CompressedPacket;
use crate::PictureType;
use crate::Resolution;
use crate::MIN_HEIGHT;
use crate::MIN_WIDTH;

/// Reads of a temporary session before giving up on its parameter sets.
const HEADER_POLLS: usize = 1000;

/// The force-pic-QP demo uses its own QP from this frame on...
const FORCE_QP_DEMO_FIRST_FRAME: u64 = 200;
/// ...and the intra QP from this one.
const FORCE_QP_INTRA_FIRST_FRAME: u64 = 300;

/// ROI demo maps go out with the frames strictly between these two.
const ROI_DEMO_AFTER: u64 = 90;
const ROI_DEMO_BEFORE: u64 = 300;

/// Packets that go by before the intra refresh cycle starts counting.
const INTRA_REFRESH_PKT_BASE: u64 = 3;

enum SessionSlot<S> {
    Ready(S),
    /// The session travels with a write running on a worker.
    #[cfg(feature = "threaded-write")]
    InFlight(PendingWrite<S>),
    /// The session was dropped by a failed dispatch.
    #[cfg_attr(not(feature = "threaded-write"), allow(dead_code))]
    Lost,
}

#[cfg(feature = "threaded-write")]
type Dispatcher<S> = Box<dyn Fn(S, FrameWrite) -> EncodeResult<PendingWrite<S>> + Send>;

/// A frame whose write runs on a worker, kept until the write settled.
#[cfg(feature = "threaded-write")]
struct InFlightFrame {
    frame: RawFrame,
    start_of_stream: bool,
}

pub struct XcoderEncoder<S: EncoderSession> {
    slot: SessionSlot<S>,
    config: EncoderConfig,
    params: EncoderParams,
    info: SessionInfo,
    open: bool,

    state: EncoderState,
    seq_change: SeqChangeState,
    /// Format of the open session, or of the last one.
    format: SessionFormat,
    /// Size the session pads pictures to.
    coded: Resolution,
    conf_win_right: u32,

    queue: FrameQueue<RawFrame>,
    reorder: ReorderState,
    roi: Option<RoiMap>,
    reconf: Option<ReconfSchedule>,
    /// Change parameters as last sent.
    change_params: EncoderChangeParams,

    /// The caller sent its last frame.
    input_ended: bool,
    /// A frame was written and its packet has not come back.
    sent_frame: bool,
    header: Vec<u8>,
    header_received: bool,
    first_packet_sent: bool,
    /// Counts from 1 at the header.
    pkt_num: u64,
    /// Frames written to the current session.
    frame_num: u64,
    extradata: Vec<u8>,
    page_size: usize,

    #[cfg(feature = "threaded-write")]
    dispatcher: Option<Dispatcher<S>>,
    #[cfg(feature = "threaded-write")]
    in_flight: Option<InFlightFrame>,
}

/// Coded size of one dimension, and the padding the conformance window has
/// to crop away again.
fn padded(size: u32, alignment: u32, min: u32) -> (u32, u32) {
    let coded = align_up(size, alignment).max(min);
    (coded, coded - size)
}

impl<S: EncoderSession> XcoderEncoder<S> {
    /// Validates `config`. The session itself is opened with the first frame,
    /// unless `generateEncHdrs` asks for the parameter sets right away.
    pub fn new(session: S, config: EncoderConfig) -> EncodeResult<Self> {
        let params = config.params()?;

        let reconf = match (params.reconf_demo_mode, &params.reconf_file) {
            (ReconfDemoMode::Off, _) | (_, None) => None,
            (mode, Some(path)) => Some(ReconfSchedule::load(mode, path)?),
        };

        let format = SessionFormat {
            resolution: check_dimensions(config.resolution)?,
            color: config.color,
        };

        let mut encoder = Self {
            slot: SessionSlot::Ready(session),
            info: Default::default(),
            open: false,
            state: EncoderState::Idle,
            seq_change: SeqChangeState::Normal,
            format,
            coded: format.resolution,
            conf_win_right: params.conf_win_right,
            queue: FrameQueue::new(),
            reorder: ReorderState::new(params.dts_offset(), config.ticks_per_frame),
            roi: None,
            reconf,
            change_params: EncoderChangeParams::default(),
            input_ended: false,
            sent_frame: false,
            header: Vec::new(),
            header_received: false,
            first_packet_sent: false,
            pkt_num: 0,
            frame_num: 0,
            extradata: Vec::new(),
            page_size: page_size(),
            #[cfg(feature = "threaded-write")]
            dispatcher: None,
            #[cfg(feature = "threaded-write")]
            in_flight: None,
            params,
            config,
        };

        if encoder.params.generate_enc_hdrs {
            encoder.generate_headers()?;
        }

        Ok(encoder)
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn seq_change_state(&self) -> SeqChangeState {
        self.seq_change
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    /// Parameter sets, when carried out of band.
    pub fn extradata(&self) -> &[u8] {
        &self.extradata
    }

    /// Frames waiting for the device.
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    fn transition(&mut self, to: EncoderState) -> EncodeResult<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(EncodeError::InvalidState {
                from: self.state,
                to,
            });
        }

        log::debug!("encoder state {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    fn session_mut(&mut self) -> EncodeResult<&mut S> {
        match &mut self.slot {
            SessionSlot::Ready(session) => Ok(session),
            _ => Err(anyhow!("encode session is not available").into()),
        }
    }

    fn session_config(&self, format: &SessionFormat) -> EncodeResult<(SessionConfig, Resolution)> {
        let codec = self.config.codec;
        let resolution = format.resolution;

        let (coded_width, pad_right) = padded(resolution.width, codec.alignment(), MIN_WIDTH);
        let (coded_height, pad_bottom) = padded(resolution.height, codec.alignment(), MIN_HEIGHT);

        let reorder = self
            .params
            .gop_preset()
            .map(|preset| preset.reorder_hint(self.params.custom_gop.as_ref()))
            .unwrap_or_default();
        let vui = build_vui(codec, self.config.sample_aspect_ratio, &format.color, reorder)?;

        let mut config = SessionConfig::new(DeviceType::Encoder, codec, resolution);
        config.selector = self.config.device.selector.clone();
        config.hw_index = self.config.device.hw_index;
        config.io_size = self.config.device.io_size;
        config.conf_win_right = self.params.conf_win_right + pad_right;
        config.conf_win_bottom = self.params.conf_win_bottom + pad_bottom;
        config.bit_depth_factor = self.config.pixel_format.bit_depth_factor();
        config.vui = Some(vui);
        config.hdr_vui = format.color.is_hdr();
        config.zero_copy = self.config.yuv_copy_bypass;
        config.encoder_params = Some(self.params.clone());

        Ok((config, Resolution::new(coded_width, coded_height)))
    }

    /// Format a session would need for `frame`.
    fn frame_format(&self, frame: &RawFrame) -> EncodeResult<SessionFormat> {
        Ok(SessionFormat {
            resolution: check_dimensions(frame.resolution)?,
            color: frame.color.overridden_by(&self.config.color),
        })
    }

    fn open_session(&mut self, format: SessionFormat) -> EncodeResult<()> {
        let (session_config, coded) = self.session_config(&format)?;

        let info = match self.session_mut()?.open(&session_config) {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to open encoder ({}), resource unavailable", e);
                return Err(e.into());
            }
        };
        log::info!(
            "encoder {} index {} (inst: {}) opened for {}",
            info.device_name,
            info.hw_index,
            info.session_id,
            format.resolution
        );

        self.info = info;
        self.open = true;
        self.format = format;
        self.coded = coded;
        self.conf_win_right = session_config.conf_win_right;
        self.roi = if self.params.roi_enable {
            RoiMap::demo(self.config.codec, self.params.roi_demo_mode, coded)
        } else {
            None
        };

        self.header_received = false;
        self.first_packet_sent = false;
        self.sent_frame = false;
        self.pkt_num = 0;
        self.frame_num = 0;
        self.reorder.reset();
        Ok(())
    }

    /// Runs a throwaway session just long enough to read its parameter sets.
    fn generate_headers(&mut self) -> EncodeResult<()> {
        let (session_config, _) = self.session_config(&self.format)?;
        let session = self.session_mut()?;
        session.open(&session_config)?;

        let mut packet = PacketRead::default();
        let mut header = None;
        for _ in 0..HEADER_POLLS {
            match session.read_packet(&mut packet) {
                Ok(0) => continue,
                Ok(size) => {
                    header = Some(
                        packet
                            .data
                            .get(PACKET_METADATA_SIZE..size)
                            .unwrap_or_default()
                            .to_vec(),
                    );
                    break;
                }
                Err(e) => {
                    log::error!("failed to read headers: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = session.close(false) {
            log::debug!("closing header session: {}", e);
        }

        let header = header.ok_or_else(|| anyhow!("encoder returned no parameter sets"))?;
        log::debug!("generated {} bytes of parameter sets", header.len());
        self.extradata = header;
        Ok(())
    }

    /// Builds the write for `frame`, side data included.
    fn prepare_write(&mut self, frame: &RawFrame) -> EncodeResult<FrameWrite> {
        let codec = self.config.codec;
        let frame_num = self.frame_num;
        let mut extra = ExtraDataBuilder::new(codec);
        let mut long_term_ref = None;

        self.change_params.enable_option = 0;
        if let Some(schedule) = self.reconf.as_mut() {
            match schedule.apply(frame_num, &mut self.change_params) {
                Some(ReconfAction::ChangeParams) => {
                    extra.change_params(self.change_params.clone());
                }
                Some(ReconfAction::LongTermRef(ltr)) => long_term_ref = Some(ltr),
                None => (),
            }
        }
        let long_term_ref = frame.long_term_ref.or(long_term_ref).unwrap_or_default();

        if let Some(bitrate) = frame.target_bitrate {
            log::debug!("frame {}: target bitrate {}", frame_num, bitrate);
            self.change_params.enable_option |= CHANGE_PARAM_RC_TARGET_RATE;
            self.change_params.bit_rate = bitrate;
            extra.change_params(self.change_params.clone());
        }

        let force_pic_qp = match self.params.force_pic_qp_demo_mode {
            0 => None,
            _ if frame_num >= FORCE_QP_INTRA_FIRST_FRAME => Some(self.params.intra_qp),
            qp if frame_num >= FORCE_QP_DEMO_FIRST_FRAME => Some(qp as i32),
            _ => None,
        };

        if let Some(map) = &self.roi {
            if frame_num > ROI_DEMO_AFTER && frame_num < ROI_DEMO_BEFORE {
                extra.roi(map.data(), map.avg_qp());
            }
        }

        if let Some(cc) = &frame.closed_caption {
            extra.closed_caption(cc)?;
        }

        let is_intra = matches!(frame.picture_type, PictureType::I | PictureType::Idr);
        let (picture_type, force_key_frame) = if self.params.force_frame_type {
            match frame.picture_type {
                PictureType::I | PictureType::Idr => (PictureType::Idr, false),
                PictureType::P => (PictureType::P, false),
                _ => (PictureType::None, false),
            }
        } else if is_intra {
            (PictureType::Idr, true)
        } else {
            (PictureType::None, false)
        };

        if self.params.preferred_transfer >= 0 {
            let intra_period = self.params.intra_period as u64;
            let header_boundary = self.params.forced_header_enable != 0
                && intra_period > 0
                && frame_num % intra_period == 0;
            if frame_num == 0 || picture_type == PictureType::Idr || header_boundary {
                extra.preferred_transfer(self.params.preferred_transfer as u8);
            }
        }

        if let Some(payload) = &frame.user_data_sei {
            extra.user_data_unregistered(payload);
        }

        let (extra_data, extra_layout) = extra.build(&self.change_params);

        let layout = HwLayout::new(
            codec,
            frame.resolution.width,
            frame.resolution.height,
            frame.format.bit_depth_factor(),
        );
        let policy = ZeroCopyPolicy {
            enabled: self.config.yuv_copy_bypass,
            supported: self.info.zero_copy_supported,
            pads_right_edge: self.params.padding && self.conf_win_right > 0,
            page_size: self.page_size,
            io_size: self.info.io_size(),
        };
        let (planes, io_size) = match placement(frame, &layout, &policy) {
            Placement::ZeroCopy { io_size } => (FramePlanes::ZeroCopy(frame.planes.clone()), io_size),
            Placement::Copy => (copy_planes(frame, &layout, self.params.padding), None),
        };

        Ok(FrameWrite {
            planes,
            strides: layout.strides_u32(),
            resolution: self.format.resolution,
            extra_data,
            extra_layout,
            pts: frame.pts,
            start_of_stream: self.state == EncoderState::Idle,
            end_of_stream: false,
            force_key_frame,
            picture_type,
            force_pic_qp,
            use_cur_src_as_long_term_pic: long_term_ref.use_cur_src_as_long_term_pic,
            use_long_term_ref: long_term_ref.use_long_term_ref,
            io_size,
        })
    }

    /// Sends `frame` to the device, or signals the end of the input with
    /// `None`.
    ///
    /// [`EncodeError::TryAgain`] means the device did not take the frame and
    /// it has to be sent again. [`SendStatus::Queued`] means the frame was
    /// kept and goes out with a later call. After the end of the input, keep
    /// calling with `None` until it fails with [`EncodeError::EndOfStream`]
    /// to push out the queued frames.
    pub fn send_frame(&mut self, frame: Option<RawFrame>) -> EncodeResult<SendStatus> {
        #[cfg(feature = "threaded-write")]
        self.settle_write()?;

        if matches!(self.state, EncoderState::Flushing | EncoderState::Eos) {
            if frame.is_some() {
                log::error!("frame sent while the encoder is flushing");
            }
            return Err(EncodeError::EndOfStream);
        }

        let mut retained = false;
        let staged = match frame {
            None => {
                if !self.input_ended {
                    log::debug!("end of input, {} frames queued", self.queue.len());
                }
                self.input_ended = true;
                None
            }
            Some(_) if self.input_ended => {
                log::error!("frame sent after the end of the input");
                return Err(EncodeError::EndOfStream);
            }
            Some(frame) if !self.queue.is_empty() || !self.seq_change.is_normal() => {
                log::trace!("frame pts {} queued behind {} frames", frame.pts, self.queue.len());
                self.queue.push_back(frame);
                if self.state == EncoderState::SequenceChangeDraining {
                    return Ok(SendStatus::Queued);
                }
                retained = true;
                None
            }
            Some(frame) => Some(frame),
        };

        let from_queue = !self.queue.is_empty();
        let mut current = if from_queue {
            self.queue.front().cloned()
        } else {
            staged
        };

        if !self.open {
            match &current {
                Some(frame) => {
                    let format = self.frame_format(frame)?;
                    self.open_session(format)?;
                }
                None => {
                    log::debug!("end of input before any frame");
                    self.transition(EncoderState::Eos)?;
                    return Ok(SendStatus::EndOfStream);
                }
            }
        }

        if self.seq_change.is_normal() {
            if let Some(frame) = &current {
                let format = self.frame_format(frame)?;
                if format != self.format {
                    log::info!(
                        "sequence change {} -> {} ({:?} -> {:?})",
                        self.format.resolution,
                        format.resolution,
                        self.format.color,
                        format.color
                    );
                    self.seq_change.transition(SeqChangeState::Draining)?;
                    if !from_queue {
                        if let Some(frame) = current.take() {
                            self.queue.push_back(frame);
                            retained = true;
                        }
                    }
                }
            }
        }

        let frame = match current {
            Some(frame) if self.seq_change.is_normal() => frame,
            _ => return self.send_end_of_stream(retained),
        };

        let write = self.prepare_write(&frame)?;

        #[cfg(feature = "threaded-write")]
        if self.dispatcher.is_some() {
            return self.write_async(frame, write, from_queue, retained);
        }

        self.write_sync(frame, write, from_queue, retained)
    }

    fn write_sync(
        &mut self,
        frame: RawFrame,
        write: FrameWrite,
        from_queue: bool,
        retained: bool,
    ) -> EncodeResult<SendStatus> {
        let result = self.session_mut()?.write_frame(&write);
        log::trace!("write of pts {}: {:?}", frame.pts, result);

        match result {
            Ok(0) | Err(DeviceError::WriteBufferFull) => {
                if self.params.strict_timeout && !retained {
                    log::error!("strict timeout period exceeded, frame pts {} not sent", frame.pts);
                    return Err(EncodeError::TryAgain);
                }
                log::debug!("write buffer full, frame pts {} kept", frame.pts);
                if !from_queue {
                    self.queue.push_back(frame);
                }
                Ok(SendStatus::Queued)
            }
            Err(DeviceError::VpuRecovery) => {
                log::warn!("VPU recovery while writing frame pts {}", frame.pts);
                self.reset()?;
                if retained {
                    Ok(SendStatus::Queued)
                } else {
                    Err(EncodeError::TryAgain)
                }
            }
            Err(e) => {
                log::error!("failed to write frame pts {}: {}", frame.pts, e);
                Err(e.into())
            }
            Ok(sent) => {
                log::debug!("frame #{} pts {} sent, {} bytes", self.frame_num, frame.pts, sent);
                self.frame_accepted(from_queue, frame.pts)?;
                self.start_flushing_if_done()?;
                Ok(if retained {
                    SendStatus::Queued
                } else {
                    SendStatus::Sent
                })
            }
        }
    }

    fn frame_accepted(&mut self, from_queue: bool, pts: i64) -> EncodeResult<()> {
        if from_queue {
            self.queue.pop_front();
        }
        self.reorder.push_pts(pts);
        self.frame_num += 1;
        self.sent_frame = true;
        self.transition(EncoderState::Started)
    }

    /// Flushes the device once the input ended and every frame went out.
    fn start_flushing_if_done(&mut self) -> EncodeResult<()> {
        if !self.input_ended || !self.queue.is_empty() || self.state != EncoderState::Started {
            return Ok(());
        }

        log::debug!("last frame sent, flushing");
        self.transition(EncoderState::Flushing)?;
        self.session_mut()?.flush()?;
        Ok(())
    }

    /// Writes end of stream, for the end of the input or to drain the session
    /// ahead of a sequence change.
    fn send_end_of_stream(&mut self, retained: bool) -> EncodeResult<SendStatus> {
        let draining = !self.seq_change.is_normal();
        log::debug!("sending end of stream (sequence change: {})", draining);

        let write = FrameWrite {
            resolution: self.format.resolution,
            start_of_stream: self.state == EncoderState::Idle,
            end_of_stream: true,
            ..Default::default()
        };

        match self.session_mut()?.write_frame(&write) {
            Ok(0) | Err(DeviceError::WriteBufferFull) | Err(DeviceError::ResourceUnavailable) => {
                log::debug!("end of stream not taken yet");
                return if retained {
                    Ok(SendStatus::Queued)
                } else {
                    Err(EncodeError::TryAgain)
                };
            }
            Err(DeviceError::VpuRecovery) => {
                log::warn!("VPU recovery while writing end of stream");
                self.reset()?;
                return if retained {
                    Ok(SendStatus::Queued)
                } else {
                    Err(EncodeError::TryAgain)
                };
            }
            Err(e) => {
                log::error!("failed to write end of stream: {}", e);
                return Err(e.into());
            }
            Ok(_) => (),
        }

        self.transition(EncoderState::Started)?;
        if draining {
            self.transition(EncoderState::SequenceChangeDraining)?;
            return Ok(if retained {
                SendStatus::Queued
            } else {
                SendStatus::Sent
            });
        }

        self.transition(EncoderState::Flushing)?;
        self.session_mut()?.flush()?;
        Ok(SendStatus::EndOfStream)
    }

    /// Reads the next packet.
    ///
    /// [`EncodeError::TryAgain`] means nothing is ready yet, including right
    /// after a sequence change completed: the queued frames then have to be
    /// sent before more packets come.
    pub fn receive_packet(&mut self) -> EncodeResult<CompressedPacket> {
        #[cfg(feature = "threaded-write")]
        self.settle_write()?;

        if self.state == EncoderState::Eos {
            log::trace!("receive_packet: end of stream");
            return Err(EncodeError::EndOfStream);
        }
        if !self.open {
            return Err(EncodeError::TryAgain);
        }

        loop {
            let mut packet = PacketRead::default();
            let result = self.session_mut()?.read_packet(&mut packet);

            match result {
                Ok(0) => {
                    if packet.end_of_stream {
                        return self.end_of_stream_reached();
                    }
                    if self.params.low_delay && self.sent_frame {
                        log::trace!("low delay mode, polling until the packet arrives");
                        continue;
                    }
                    self.sent_frame = false;
                    if matches!(
                        self.state,
                        EncoderState::Flushing | EncoderState::SequenceChangeDraining
                    ) {
                        continue;
                    }
                    return Err(EncodeError::TryAgain);
                }
                Ok(size) => {
                    let end_of_stream = packet.end_of_stream;
                    let Some(out) = self.surface(packet, size) else {
                        if self.params.low_delay {
                            log::trace!("low delay mode, polling past the header");
                            continue;
                        }
                        return Err(EncodeError::TryAgain);
                    };
                    if end_of_stream {
                        // The packet is out already, the outcome of the end
                        // of stream only shows on the next call.
                        if let Err(e) = self.end_of_stream_reached() {
                            if !matches!(e, EncodeError::TryAgain | EncodeError::EndOfStream) {
                                return Err(e);
                            }
                        }
                    }
                    return Ok(out);
                }
                Err(DeviceError::VpuRecovery) => {
                    log::warn!("VPU recovery while reading packets");
                    self.reset()?;
                    return Err(EncodeError::TryAgain);
                }
                Err(DeviceError::InvalidSession) if self.state == EncoderState::Idle => {
                    log::error!("receive_packet: session not started, invalid session");
                    return Err(EncodeError::TryAgain);
                }
                Err(e) => {
                    log::error!("persistent failure reading packets: {}", e);
                    self.sent_frame = false;
                    return Err(e.into());
                }
            }
        }
    }

    fn end_of_stream_reached(&mut self) -> EncodeResult<CompressedPacket> {
        match self.state {
            EncoderState::SequenceChangeDraining => {
                self.reinit()?;
                Err(EncodeError::TryAgain)
            }
            EncoderState::Flushing => {
                self.transition(EncoderState::Eos)?;
                Err(EncodeError::EndOfStream)
            }
            state => {
                log::warn!("end of stream from the device in state {:?}", state);
                Err(EncodeError::EndOfStream)
            }
        }
    }

    /// Turns what the device returned into a packet. The first data of a
    /// session is the parameter sets, kept and not surfaced.
    fn surface(&mut self, packet: PacketRead, size: usize) -> Option<CompressedPacket> {
        let end = size.min(packet.data.len());
        let payload = packet.data.get(PACKET_METADATA_SIZE..end).unwrap_or_default();

        if !self.header_received {
            log::debug!("got {} bytes of parameter sets", payload.len());
            self.header = payload.to_vec();
            self.header_received = true;
            self.pkt_num = 1;
            return None;
        }

        self.sent_frame = false;
        self.pkt_num += 1;

        let mut new_extradata = None;
        let prepend = if !self.first_packet_sent {
            self.first_packet_sent = true;
            self.reorder.set_first_pts(packet.pts);
            if self.config.global_header && self.extradata != self.header {
                log::debug!("extradata updated to {} bytes", self.header.len());
                self.extradata = self.header.clone();
            }
            new_extradata = Some(self.header.clone());
            !self.config.global_header
        } else {
            let due = self.params.intra_refresh_cycle().is_some_and(|cycle| {
                self.pkt_num > INTRA_REFRESH_PKT_BASE
                    && (self.pkt_num - INTRA_REFRESH_PKT_BASE) % cycle as u64 == 0
            });
            if due {
                log::trace!("packet {} forces a header for intra refresh", self.pkt_num - 1);
            }
            due
        };

        let mut data = Vec::with_capacity(payload.len() + self.header.len());
        if prepend {
            data.extend_from_slice(&self.header);
        }
        data.extend_from_slice(payload);

        let dts = self.reorder.next_dts(packet.pts);
        log::debug!(
            "packet #{} pts {} dts {} size {}",
            self.pkt_num - 1,
            packet.pts,
            dts,
            data.len()
        );

        Some(CompressedPacket {
            data,
            pts: Some(packet.pts),
            dts: Some(dts),
            key_frame: packet.frame_type == 0,
            new_extradata,
            ..Default::default()
        })
    }

    /// Sends `frame` and returns the next packet, if any. Sending is skipped
    /// once the encoder is flushing.
    pub fn encode(&mut self, frame: Option<RawFrame>) -> EncodeResult<Option<CompressedPacket>> {
        if !matches!(self.state, EncoderState::Flushing | EncoderState::Eos) {
            match self.send_frame(frame) {
                Ok(_) | Err(EncodeError::EndOfStream) => (),
                Err(e) => return Err(e),
            }
        }

        match self.receive_packet() {
            Ok(packet) => Ok(Some(packet)),
            Err(EncodeError::TryAgain | EncodeError::EndOfStream) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replaces the drained session. The new one is opened with the next
    /// frame, which is the queue head.
    fn reinit(&mut self) -> EncodeResult<()> {
        self.seq_change.transition(SeqChangeState::Reinitializing)?;
        if let Some(frame) = self.queue.front() {
            log::info!(
                "sequence change completed, reopening for {} ({} frames queued)",
                frame.resolution,
                self.queue.len()
            );
        }

        self.close_session(true);
        self.transition(EncoderState::Idle)?;
        self.seq_change.transition(SeqChangeState::Normal)
    }

    /// Replaces the session after the device recovered. Queued frames are
    /// kept, frames already written are lost with the old session.
    fn reset(&mut self) -> EncodeResult<()> {
        if self.seq_change == SeqChangeState::Draining {
            return self.reinit();
        }

        log::warn!("encoder reset");
        self.close_session(false);
        self.transition(EncoderState::Idle)?;
        self.open_session(self.format)
    }

    fn close_session(&mut self, eos: bool) {
        if !self.open {
            return;
        }
        self.open = false;

        match self.session_mut() {
            Ok(session) => {
                if let Err(e) = session.close(eos) {
                    log::error!("failed to close encode session: {}", e);
                }
            }
            Err(e) => log::error!("failed to close encode session: {}", e),
        }
    }

    /// Closes the session. Failures are logged only.
    pub fn close(&mut self) {
        #[cfg(feature = "threaded-write")]
        if let Err(e) = self.settle_write() {
            log::warn!("pending write failed while closing: {}", e);
        }

        self.close_session(self.state == EncoderState::Eos);
    }

    #[cfg(feature = "threaded-write")]
    fn write_async(
        &mut self,
        frame: RawFrame,
        write: FrameWrite,
        from_queue: bool,
        retained: bool,
    ) -> EncodeResult<SendStatus> {
        let dispatch = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| anyhow!("no write pool"))?;
        let SessionSlot::Ready(session) = std::mem::replace(&mut self.slot, SessionSlot::Lost)
        else {
            return Err(anyhow!("encode session is not available").into());
        };

        let start_of_stream = write.start_of_stream;
        log::trace!("dispatching write of pts {}", frame.pts);
        self.slot = SessionSlot::InFlight(dispatch(session, write)?);

        self.frame_accepted(from_queue, frame.pts)?;
        self.in_flight = Some(InFlightFrame {
            frame,
            start_of_stream,
        });
        Ok(if retained {
            SendStatus::Queued
        } else {
            SendStatus::Sent
        })
    }

    /// Waits for the write running on a worker, if any, and takes the
    /// session back. A frame the device did not take goes back to the queue
    /// head.
    #[cfg(feature = "threaded-write")]
    fn settle_write(&mut self) -> EncodeResult<()> {
        let pending = match std::mem::replace(&mut self.slot, SessionSlot::Lost) {
            SessionSlot::InFlight(pending) => pending,
            other => {
                self.slot = other;
                return Ok(());
            }
        };

        let (session, result) = pending.wait()?;
        self.slot = SessionSlot::Ready(session);
        let Some(InFlightFrame {
            frame,
            start_of_stream,
        }) = self.in_flight.take()
        else {
            return Ok(());
        };

        match result {
            Ok(sent) if sent > 0 => {
                log::debug!("threaded write of pts {} done, {} bytes", frame.pts, sent);
                self.start_flushing_if_done()
            }
            Ok(_) | Err(DeviceError::WriteBufferFull) | Err(DeviceError::ResourceUnavailable) => {
                log::warn!("threaded write of pts {} not taken, requeued", frame.pts);
                self.requeue(frame, start_of_stream)
            }
            Err(DeviceError::VpuRecovery) => {
                log::warn!("VPU recovery in threaded write of pts {}", frame.pts);
                self.requeue(frame, start_of_stream)?;
                self.reset()
            }
            Err(e) => {
                log::error!("threaded write of pts {} failed: {}", frame.pts, e);
                Err(e.into())
            }
        }
    }

    #[cfg(feature = "threaded-write")]
    fn requeue(&mut self, frame: RawFrame, start_of_stream: bool) -> EncodeResult<()> {
        self.reorder.unpush_pts();
        self.frame_num = self.frame_num.saturating_sub(1);
        self.queue.push_front(frame);
        if start_of_stream {
            self.transition(EncoderState::Idle)?;
        }
        Ok(())
    }
}

#[cfg(feature = "threaded-write")]
impl<S: EncoderSession + Send + 'static> XcoderEncoder<S> {
    /// Moves frame writes to the workers of `pool`. End of stream is still
    /// written from the calling thread.
    pub fn with_write_pool(mut self, pool: Arc<WritePool>) -> Self {
        self.dispatcher = Some(Box::new(move |session, write| pool.dispatch(session, write)));
        self
    }
}

impl<S: EncoderSession> Drop for XcoderEncoder<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::backend::dummy::lock;
    use crate::backend::dummy::DummyHandle;
    use crate::backend::dummy::DummySession;
    use crate::backend::dummy::WriteOutcome;
    use crate::Codec;
    use crate::PixelFormat;
    use crate::TransferCharacteristic;

    const HEADER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42];

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(params: &str) -> EncoderConfig {
        let mut config = EncoderConfig::new(Codec::H264, Resolution::new(64, 64));
        if !params.is_empty() {
            config.xcoder_params = Some(params.to_string());
        }
        config
    }

    fn encoder(config: EncoderConfig) -> (XcoderEncoder<DummySession>, DummyHandle) {
        init();
        let session = DummySession::echoing(&HEADER);
        let handle = session.handle();
        (XcoderEncoder::new(session, config).unwrap(), handle)
    }

    fn frame(width: u32, height: u32, pts: i64) -> RawFrame {
        let size = (width * height * 3 / 2) as usize;
        RawFrame::from_i420(
            Bytes::from(vec![0x80; size]),
            Resolution::new(width, height),
            PixelFormat::I420,
            pts,
        )
        .unwrap()
    }

    /// Receives until the end of the stream.
    fn drain(enc: &mut XcoderEncoder<DummySession>) -> Vec<CompressedPacket> {
        let mut packets = Vec::new();
        for _ in 0..100 {
            match enc.receive_packet() {
                Ok(packet) => packets.push(packet),
                Err(EncodeError::TryAgain) => continue,
                Err(EncodeError::EndOfStream) => return packets,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        panic!("no end of stream");
    }

    fn pts_of(packets: &[CompressedPacket]) -> Vec<i64> {
        packets.iter().filter_map(|p| p.pts).collect()
    }

    fn written_pts(handle: &DummyHandle) -> Vec<i64> {
        lock(handle)
            .frame_writes
            .iter()
            .filter(|w| !w.end_of_stream)
            .map(|w| w.pts)
            .collect()
    }

    #[test]
    fn opens_lazily_with_the_first_frame() {
        let (mut enc, handle) = encoder(config(""));
        assert!(lock(&handle).opens.is_empty());

        assert_eq!(enc.send_frame(Some(frame(96, 64, 0))).unwrap(), SendStatus::Sent);
        let state = lock(&handle);
        assert_eq!(state.opens.len(), 1);
        assert_eq!(state.opens[0].resolution, Resolution::new(96, 64));
        assert!(state.frame_writes[0].start_of_stream);
        assert_eq!(enc.state(), EncoderState::Started);
    }

    #[test]
    fn conformance_window_covers_the_padding() {
        let (enc, _) = encoder(config(""));
        let format = |width, height| SessionFormat {
            resolution: Resolution::new(width, height),
            color: Default::default(),
        };

        let (session, coded) = enc.session_config(&format(64, 48)).unwrap();
        assert_eq!(coded, Resolution::new(256, 128));
        assert_eq!((session.conf_win_right, session.conf_win_bottom), (192, 80));

        let (session, coded) = enc.session_config(&format(1920, 1080)).unwrap();
        assert_eq!(coded, Resolution::new(1920, 1088));
        assert_eq!((session.conf_win_right, session.conf_win_bottom), (0, 8));

        let mut config = config("confWinRight=4");
        config.codec = Codec::H265;
        let (enc, _) = encoder(config);
        let (session, coded) = enc.session_config(&format(1918, 1080)).unwrap();
        assert_eq!(coded, Resolution::new(1920, 1080));
        assert_eq!((session.conf_win_right, session.conf_win_bottom), (6, 0));
        assert!(session.vui.is_some());
    }

    #[test]
    fn header_goes_ahead_of_the_first_packet() {
        let (mut enc, _) = encoder(config(""));
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        enc.send_frame(Some(frame(64, 64, 1))).unwrap();

        // The parameter sets come first and are not surfaced.
        assert!(matches!(enc.receive_packet(), Err(EncodeError::TryAgain)));

        let first = enc.receive_packet().unwrap();
        assert!(first.data.starts_with(&HEADER));
        assert_eq!(first.new_extradata.as_deref(), Some(&HEADER[..]));
        assert!(first.key_frame);
        assert_eq!(first.pts, Some(0));

        let second = enc.receive_packet().unwrap();
        assert!(!second.data.starts_with(&HEADER));
        assert!(!second.key_frame);
        assert_eq!(second.new_extradata, None);
    }

    #[test]
    fn global_header_goes_to_extradata() {
        let mut config = config("");
        config.global_header = true;
        let (mut enc, _) = encoder(config);
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        enc.send_frame(None).unwrap();

        let packets = drain(&mut enc);
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].data.starts_with(&HEADER));
        assert_eq!(packets[0].new_extradata.as_deref(), Some(&HEADER[..]));
        assert_eq!(enc.extradata(), &HEADER);
    }

    #[test]
    fn low_delay_reads_past_the_header() {
        let (mut enc, _) = encoder(config("lowDelay=1"));
        enc.send_frame(Some(frame(64, 64, 7))).unwrap();
        assert_eq!(enc.receive_packet().unwrap().pts, Some(7));
    }

    #[test]
    fn backpressure_keeps_frame_order() {
        let (mut enc, handle) = encoder(config(""));
        lock(&handle)
            .write_results
            .extend([WriteOutcome::Reject, WriteOutcome::Reject]);

        assert_eq!(enc.send_frame(Some(frame(64, 64, 0))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.send_frame(Some(frame(64, 64, 1))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.queued_frames(), 2);
        // Frame 0 goes out, frame 2 waits behind frame 1.
        assert_eq!(enc.send_frame(Some(frame(64, 64, 2))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.queued_frames(), 2);

        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::Sent);
        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::Sent);
        assert_eq!(enc.state(), EncoderState::Flushing);
        assert!(matches!(enc.send_frame(None), Err(EncodeError::EndOfStream)));

        assert_eq!(written_pts(&handle), vec![0, 1, 2]);
        assert_eq!(lock(&handle).flushes, 1);

        let packets = drain(&mut enc);
        assert_eq!(pts_of(&packets), vec![0, 1, 2]);
        assert_eq!(enc.state(), EncoderState::Eos);
    }

    #[test]
    fn strict_timeout_hands_the_frame_back() {
        let (mut enc, handle) = encoder(config("strictTimeout=1"));
        lock(&handle).write_results.push_back(WriteOutcome::Reject);

        let f = frame(64, 64, 0);
        assert!(matches!(enc.send_frame(Some(f.clone())), Err(EncodeError::TryAgain)));
        assert_eq!(enc.queued_frames(), 0);
        assert_eq!(enc.send_frame(Some(f)).unwrap(), SendStatus::Sent);
        assert_eq!(written_pts(&handle), vec![0]);
    }

    #[test]
    fn dts_counts_back_from_the_first_pts() {
        // The default GOP preset reorders by two pictures.
        let (mut enc, _) = encoder(config(""));
        assert_eq!(enc.reorder.dts_offset(), 2);

        for pts in 0..5 {
            enc.send_frame(Some(frame(64, 64, pts * 2))).unwrap();
        }
        enc.send_frame(None).unwrap();

        let packets = drain(&mut enc);
        let dts: Vec<i64> = packets.iter().filter_map(|p| p.dts).collect();
        assert_eq!(dts, vec![-2, -1, 0, 2, 4]);
        assert!(packets.iter().all(|p| p.dts <= p.pts));
    }

    #[test]
    fn resolution_change_loses_no_frame() {
        let (mut enc, handle) = encoder(config(""));
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        enc.send_frame(Some(frame(64, 64, 1))).unwrap();

        assert_eq!(enc.send_frame(Some(frame(128, 64, 2))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.seq_change_state(), SeqChangeState::Draining);
        assert_eq!(enc.state(), EncoderState::SequenceChangeDraining);
        assert_eq!(enc.queued_frames(), 1);
        assert_eq!(enc.send_frame(Some(frame(128, 64, 3))).unwrap(), SendStatus::Queued);

        let mut packets = drain_until_reinit(&mut enc);
        assert_eq!(enc.seq_change_state(), SeqChangeState::Normal);
        assert_eq!(enc.state(), EncoderState::Idle);
        assert_eq!(lock(&handle).closes, vec![true]);
        assert_eq!(enc.queued_frames(), 2);

        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::Sent);
        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::Sent);
        packets.extend(drain(&mut enc));

        assert_eq!(pts_of(&packets), vec![0, 1, 2, 3]);
        assert_eq!(written_pts(&handle), vec![0, 1, 2, 3]);
        let state = lock(&handle);
        assert_eq!(state.opens.len(), 2);
        assert_eq!(state.opens[1].resolution, Resolution::new(128, 64));
        assert!(state.frame_writes[2].end_of_stream);
        assert!(state.frame_writes[3].start_of_stream);
    }

    /// Receives until the drained session is replaced.
    fn drain_until_reinit(enc: &mut XcoderEncoder<DummySession>) -> Vec<CompressedPacket> {
        let mut packets = Vec::new();
        for _ in 0..100 {
            match enc.receive_packet() {
                Ok(packet) => packets.push(packet),
                Err(EncodeError::TryAgain) if enc.seq_change_state().is_normal() => {
                    return packets
                }
                Err(EncodeError::TryAgain) => continue,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        panic!("session never reinitialized");
    }

    #[test]
    fn colour_change_is_a_sequence_change() {
        let (mut enc, _) = encoder(config(""));
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();

        let mut hdr = frame(64, 64, 1);
        hdr.color.transfer = TransferCharacteristic::Smpte2084;
        enc.send_frame(Some(hdr)).unwrap();
        assert_eq!(enc.seq_change_state(), SeqChangeState::Draining);
    }

    #[test]
    fn forced_colour_is_not_a_change() {
        let mut config = config("");
        config.color.transfer = TransferCharacteristic::AribStdB67;
        let (mut enc, handle) = encoder(config);
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();

        let mut other = frame(64, 64, 1);
        other.color.transfer = TransferCharacteristic::Smpte2084;
        enc.send_frame(Some(other)).unwrap();
        assert!(enc.seq_change_state().is_normal());
        assert!(lock(&handle).opens[0].hdr_vui);
    }

    #[test]
    fn vpu_recovery_reopens_and_asks_again() {
        let (mut enc, handle) = encoder(config(""));
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        lock(&handle)
            .write_results
            .push_back(WriteOutcome::Fail(DeviceError::VpuRecovery));

        let f = frame(64, 64, 1);
        assert!(matches!(enc.send_frame(Some(f.clone())), Err(EncodeError::TryAgain)));
        {
            let state = lock(&handle);
            assert_eq!(state.closes, vec![false]);
            assert_eq!(state.opens.len(), 2);
            assert!(state.is_open);
        }
        assert_eq!(enc.state(), EncoderState::Idle);

        assert_eq!(enc.send_frame(Some(f)).unwrap(), SendStatus::Sent);
        assert!(lock(&handle).frame_writes.last().unwrap().start_of_stream);
    }

    #[test]
    fn vpu_recovery_keeps_the_queue() {
        let (mut enc, handle) = encoder(config(""));
        lock(&handle).write_results.extend([
            WriteOutcome::Reject,
            WriteOutcome::Fail(DeviceError::VpuRecovery),
        ]);

        assert_eq!(enc.send_frame(Some(frame(64, 64, 0))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.send_frame(Some(frame(64, 64, 1))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.queued_frames(), 2);
        assert_eq!(lock(&handle).opens.len(), 2);

        enc.send_frame(None).unwrap();
        enc.send_frame(None).unwrap();
        assert_eq!(pts_of(&drain(&mut enc)), vec![0, 1]);
    }

    #[test]
    fn trailer_carries_the_side_data() {
        let (mut enc, handle) = encoder(config("prefTRC=18"));

        let mut first = frame(64, 64, 0);
        first.closed_caption = Some(vec![0xfc, 0x80, 0x80, 0xfd, 0x80, 0x80]);
        first.target_bitrate = Some(1_000_000);
        enc.send_frame(Some(first)).unwrap();
        enc.send_frame(Some(frame(64, 64, 1))).unwrap();

        let mut idr = frame(64, 64, 2);
        idr.picture_type = PictureType::I;
        enc.send_frame(Some(idr)).unwrap();

        let state = lock(&handle);
        let layout = state.frame_writes[0].extra_layout;
        assert_eq!(layout.reconf_len, 128);
        assert_eq!(layout.sei_cc_len, 17 + 6 + 2);
        assert_eq!(layout.preferred_characteristics_len, 9);
        assert_eq!(state.frame_writes[0].extra_data.len(), layout.total_len());
        assert_eq!(&state.frame_writes[0].extra_data[..4], &CHANGE_PARAM_RC_TARGET_RATE.to_le_bytes());

        assert!(state.frame_writes[1].extra_data.is_empty());

        let idr = &state.frame_writes[2];
        assert!(idr.force_key_frame);
        assert_eq!(idr.picture_type, PictureType::Idr);
        assert_eq!(idr.extra_layout.preferred_characteristics_len, 9);
        // The block carries the last bitrate but nothing to apply.
        assert_eq!(&idr.extra_data[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn forced_frame_types() {
        let (mut enc, handle) = encoder(config("forceFrameType=1"));
        let mut i = frame(64, 64, 0);
        i.picture_type = PictureType::I;
        let mut p = frame(64, 64, 1);
        p.picture_type = PictureType::P;
        enc.send_frame(Some(i)).unwrap();
        enc.send_frame(Some(p)).unwrap();

        let state = lock(&handle);
        assert_eq!(state.frame_writes[0].picture_type, PictureType::Idr);
        assert!(!state.frame_writes[0].force_key_frame);
        assert_eq!(state.frame_writes[1].picture_type, PictureType::P);
    }

    #[test]
    fn intra_refresh_repeats_the_header() {
        let (mut enc, _) = encoder(config(
            "forcedHeaderEnable=1:intraRefreshMode=1:intraRefreshMinPeriod=2",
        ));
        for pts in 0..7 {
            enc.send_frame(Some(frame(64, 64, pts))).unwrap();
        }
        enc.send_frame(None).unwrap();

        let with_header: Vec<i64> = drain(&mut enc)
            .iter()
            .filter(|p| p.data.starts_with(&HEADER))
            .filter_map(|p| p.pts)
            .collect();
        assert_eq!(with_header, vec![0, 3, 5]);
    }

    #[test]
    fn headers_generated_up_front() {
        let (mut enc, handle) = encoder(config("generateEncHdrs=1"));
        assert_eq!(enc.extradata(), &HEADER);
        {
            let state = lock(&handle);
            assert_eq!(state.opens.len(), 1);
            assert_eq!(state.closes, vec![false]);
            assert!(!state.is_open);
        }

        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        assert_eq!(lock(&handle).opens.len(), 2);
    }

    #[test]
    fn zero_copy_only_for_hardware_layout() {
        let page = page_size();
        let (width, height) = (256u32, 128u32);
        let size = (width * height * 3 / 2) as usize;
        let buf = Bytes::from(vec![0u8; size + page]);
        let skip = (page - buf.as_ptr() as usize % page) % page;
        let aligned = buf.slice(skip..skip + size);
        let raw = |pts| {
            RawFrame::from_i420(aligned.clone(), Resolution::new(width, height), PixelFormat::I420, pts)
                .unwrap()
        };

        let mut config = config("");
        config.resolution = Resolution::new(width, height);
        let (mut enc, handle) = encoder(config);
        lock(&handle).info.zero_copy_supported = true;
        enc.send_frame(Some(raw(0))).unwrap();

        let mut config = self::config("");
        config.resolution = Resolution::new(width, height);
        config.yuv_copy_bypass = false;
        let (mut copying, copy_handle) = encoder(config);
        lock(&copy_handle).info.zero_copy_supported = true;
        copying.send_frame(Some(raw(0))).unwrap();

        assert!(matches!(
            lock(&handle).frame_writes[0].planes,
            FramePlanes::ZeroCopy(_)
        ));
        assert_eq!(lock(&handle).frame_writes[0].io_size, None);
        assert!(matches!(
            lock(&copy_handle).frame_writes[0].planes,
            FramePlanes::Copied { .. }
        ));
    }

    #[test]
    fn end_of_input_before_any_frame() {
        let (mut enc, handle) = encoder(config(""));
        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::EndOfStream);
        assert_eq!(enc.state(), EncoderState::Eos);
        assert!(matches!(enc.receive_packet(), Err(EncodeError::EndOfStream)));
        assert!(lock(&handle).opens.is_empty());
    }

    #[test]
    fn encode_combines_send_and_receive() {
        let (mut enc, _) = encoder(config("lowDelay=1"));
        let packet = enc.encode(Some(frame(64, 64, 0))).unwrap().unwrap();
        assert_eq!(packet.pts, Some(0));

        let mut rest = Vec::new();
        for _ in 0..10 {
            match enc.encode(None).unwrap() {
                Some(packet) => rest.push(packet),
                None if enc.state() == EncoderState::Eos => break,
                None => (),
            }
        }
        assert!(rest.is_empty());
        assert_eq!(enc.state(), EncoderState::Eos);
    }

    #[test]
    fn drop_closes_the_session() {
        let (mut enc, handle) = encoder(config(""));
        enc.send_frame(Some(frame(64, 64, 0))).unwrap();
        drop(enc);
        assert_eq!(lock(&handle).closes, vec![false]);
    }

    #[cfg(feature = "threaded-write")]
    #[test]
    fn threaded_writes_requeue_rejected_frames() {
        let pool = Arc::new(WritePool::new(2, 4).unwrap());
        let (enc, handle) = encoder(config(""));
        let mut enc = enc.with_write_pool(pool);
        lock(&handle)
            .write_results
            .extend([WriteOutcome::Accept, WriteOutcome::Reject]);

        assert_eq!(enc.send_frame(Some(frame(64, 64, 0))).unwrap(), SendStatus::Sent);
        assert_eq!(enc.send_frame(Some(frame(64, 64, 1))).unwrap(), SendStatus::Sent);
        // The write of frame 1 was rejected on the worker: it is written again
        // ahead of frame 2.
        assert_eq!(enc.send_frame(Some(frame(64, 64, 2))).unwrap(), SendStatus::Queued);
        assert_eq!(enc.send_frame(None).unwrap(), SendStatus::Sent);

        let packets = drain(&mut enc);
        assert_eq!(pts_of(&packets), vec![0, 1, 2]);
        assert_eq!(written_pts(&handle), vec![0, 1, 2]);
    }
}
