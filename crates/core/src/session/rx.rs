//! Receive pipeline session.
//!
//! The worker's `poll()` drains packet bursts from each port's NIC queue
//! and feeds them through the depacketizer into ring slots; complete
//! frames convert to the application's surface format and surface through
//! `get_frame`. Redundant ports write into the same slot keyed by RTP
//! timestamp, so a frame completed from both streams is delivered once
//! with `Reconstructed` status.
//!
//! With format auto-detection the session is created without geometry:
//! the first whole frame on the wire yields the width, height, and rate,
//! the application confirms via `notify_detected`, and only then is the
//! frame ring allocated. The detection frame itself is discarded.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::depacketizer::{DetectedMeta, FormatDetector, RxPacketOutcome};
use crate::codec::packet::{ParsedPacket, PKT_MAX_UDP_BYTES, RTP_HDR_SIZE};
use crate::codec::{Depacketizer, PacketGeometry, PackingMode};
use crate::convert::{ConvertRequest, Device, Selection};
use crate::error::{Result, TransportError};
use crate::frame::ring::{FrameRing, RingConfig};
use crate::frame::{Fps, Frame, PixelFormat, TransportFormat, MAX_PORTS};
use crate::instance::Instance;
use crate::pacing::{nominal_trs_ns, PacingProfile};
use crate::session::timing::TimingParser;
use crate::session::tx::{sync_frame_meta, ConverterBinding, RingConvertSource};
use crate::session::{EventQueue, PollStatus, SessionEvent, SessionState, StateCell};
use crate::stats::{self, trace, SessionStats};
use crate::transport::{NicQueue, PtpClock, RxPacket};

/// Application's answer to format detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetectReply {
    /// Override the ring capacity chosen at create time.
    pub framebuff_cnt: Option<usize>,
}

/// Application callbacks. All run on the worker thread and must not block.
pub trait RxEvents: Send + Sync {
    /// A converted frame is ready; edge-trigger for `get_frame`.
    fn frame_available(&self) {}
    /// Auto-detection concluded; called exactly once, synchronously,
    /// before the frame ring is allocated.
    fn notify_detected(&self, _meta: &DetectedMeta) -> DetectReply {
        DetectReply::default()
    }
    fn event(&self, _event: &SessionEvent) {}
}

/// Default no-op callback set for applications that poll.
pub struct NullRxEvents;
impl RxEvents for NullRxEvents {}

/// A received frame loaned to the application.
#[derive(Debug)]
pub struct RxFrame {
    pub slot: usize,
    pub frame: Frame,
    pub user_meta: Vec<u8>,
}

/// Receive session configuration.
#[derive(Clone)]
pub struct VideoRxConfig {
    pub name: Option<String>,
    /// Ignored when `auto_detect` is set.
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub interlaced: bool,
    /// Application surface format.
    pub output_fmt: PixelFormat,
    /// On-wire ST 2110-20 format.
    pub transport_fmt: TransportFormat,
    pub packing: PackingMode,
    pub pacing_profile: PacingProfile,
    pub payload_type: u8,
    pub framebuff_cnt: usize,
    pub device: Device,
    pub blocking_get: bool,
    pub block_timeout: Duration,
    /// Create without geometry and infer it from the first frame.
    pub auto_detect: bool,
    /// Deliver short frames with `Corrupted` status instead of dropping.
    pub receive_incomplete: bool,
    /// 1 = primary only, 2 = primary + redundant.
    pub num_ports: usize,
    /// Header-split NIC mode: payload DMA lands straight in frame
    /// buffers. Requires derive mode.
    pub header_split: bool,
    pub enable_timing_parser: bool,
    /// Frames reassembled concurrently before the oldest is evicted.
    pub max_in_flight: usize,
}

impl Default for VideoRxConfig {
    fn default() -> Self {
        VideoRxConfig {
            name: None,
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            interlaced: false,
            output_fmt: PixelFormat::Yuv422Planar10Le,
            transport_fmt: TransportFormat::Yuv422_10bit,
            packing: PackingMode::BlockPacking,
            pacing_profile: PacingProfile::Narrow,
            payload_type: 112,
            framebuff_cnt: 4,
            device: Device::Auto,
            blocking_get: false,
            block_timeout: Duration::from_secs(1),
            auto_detect: false,
            receive_incomplete: false,
            num_ports: 1,
            header_split: false,
            enable_timing_parser: false,
            max_in_flight: 3,
        }
    }
}

/// Built once geometry is known (at create, or after detection).
struct RxPipeline {
    ring: Arc<FrameRing>,
    geometry: PacketGeometry,
    depacketizer: Depacketizer,
    timing: Option<TimingParser>,
    converter: ConverterBinding,
}

struct RxEngine {
    queues: Vec<Box<dyn NicQueue>>,
    pipeline: Option<RxPipeline>,
    detector: Option<FormatDetector>,
}

/// ST 2110-20 receive session.
pub struct VideoRx {
    id: u64,
    name: String,
    state: StateCell,
    cfg: VideoRxConfig,
    engine: Mutex<RxEngine>,
    /// Ring handle mirrored out of the engine so `get_frame`/`put_frame`
    /// never contend with the packet path for the engine lock.
    ring: Mutex<Option<Arc<FrameRing>>>,
    clock: Arc<dyn PtpClock>,
    events: Arc<dyn RxEvents>,
    events_q: EventQueue,
    stats: Arc<Mutex<SessionStats>>,
    instance: Arc<Instance>,
}

impl VideoRx {
    pub fn new(
        instance: Arc<Instance>,
        clock: Arc<dyn PtpClock>,
        queues: Vec<Box<dyn NicQueue>>,
        events: Arc<dyn RxEvents>,
        cfg: VideoRxConfig,
    ) -> Result<Self> {
        if cfg.payload_type > 127 {
            return Err(TransportError::InvalidArgument(format!(
                "payload type {} exceeds 7 bits",
                cfg.payload_type
            )));
        }
        if cfg.num_ports == 0 || cfg.num_ports > MAX_PORTS {
            return Err(TransportError::InvalidArgument(format!(
                "{} ports unsupported",
                cfg.num_ports
            )));
        }
        if queues.len() != cfg.num_ports {
            return Err(TransportError::InvalidArgument(format!(
                "{} queues for {} ports",
                queues.len(),
                cfg.num_ports
            )));
        }
        let derive = cfg.output_fmt == cfg.transport_fmt.to_pixel_format();
        if cfg.header_split && !derive {
            return Err(TransportError::InvalidArgument(
                "header split requires derive mode".into(),
            ));
        }

        let id = instance.next_session_id();
        let name = cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("ST20_RX_{id}"));

        let session = VideoRx {
            id,
            name,
            state: StateCell::new(),
            engine: Mutex::new(RxEngine {
                queues,
                pipeline: None,
                detector: cfg.auto_detect.then(FormatDetector::new),
            }),
            ring: Mutex::new(None),
            clock,
            events,
            events_q: EventQueue::new(64),
            stats: Arc::new(Mutex::new(SessionStats::default())),
            instance,
            cfg,
        };

        if !session.cfg.auto_detect {
            let meta = DetectedMeta {
                width: session.cfg.width,
                height: session.cfg.height,
                fps: session.cfg.fps,
                interlaced: session.cfg.interlaced,
            };
            let pipeline = session.build_pipeline(&meta, session.cfg.framebuff_cnt)?;
            let mut eng = session.engine.lock();
            *session.ring.lock() = Some(pipeline.ring.clone());
            eng.pipeline = Some(pipeline);
        } else {
            tracing::info!(session = id, "auto-detect enabled, ring deferred");
        }

        tracing::info!(
            session = id,
            name = %session.name,
            fmt = session.cfg.output_fmt.name(),
            transport = session.cfg.transport_fmt.name(),
            derive,
            ports = session.cfg.num_ports,
            "rx session created"
        );
        Ok(session)
    }

    fn build_pipeline(&self, meta: &DetectedMeta, framebuff_cnt: usize) -> Result<RxPipeline> {
        let wire_fmt = self.cfg.transport_fmt.to_pixel_format();
        let derive = self.cfg.output_fmt == wire_fmt;
        let geometry = PacketGeometry::new(
            self.cfg.packing,
            wire_fmt,
            meta.width,
            meta.height,
            meta.interlaced,
        )?;
        let ring = Arc::new(FrameRing::new(RingConfig {
            capacity: framebuff_cnt,
            surface_fmt: self.cfg.output_fmt,
            wire_fmt,
            width: meta.width,
            height: meta.height,
            interlaced: meta.interlaced,
            derive,
            external: false,
            blocking_get: self.cfg.blocking_get,
            user_meta_capacity: PKT_MAX_UDP_BYTES - RTP_HDR_SIZE,
        })?);

        let converter = if derive {
            ConverterBinding::Derive
        } else {
            let req = ConvertRequest {
                input: wire_fmt,
                output: self.cfg.output_fmt,
                width: meta.width,
                height: meta.height,
                fps: meta.fps,
                interlaced: meta.interlaced,
                framebuff_cnt,
                device: self.cfg.device,
            };
            match self.instance.converters.select(&req)? {
                Selection::Internal(f) => ConverterBinding::Internal(f),
                Selection::Plugin(plugin) => {
                    let source = Arc::new(RingConvertSource {
                        ring: ring.clone(),
                        rx: true,
                        stats: self.stats.clone(),
                        on_fail: Box::new(|| {}),
                    });
                    let converter = plugin.create(&req, source)?;
                    self.instance.converters.attach(self.id, &converter);
                    ConverterBinding::Plugin(converter)
                }
            }
        };

        let timing = self.cfg.enable_timing_parser.then(|| {
            TimingParser::new(nominal_trs_ns(
                self.cfg.pacing_profile,
                meta.fps,
                meta.height,
                meta.interlaced,
                geometry.total_pkts,
            ))
        });

        Ok(RxPipeline {
            ring,
            geometry,
            depacketizer: Depacketizer::new(geometry, self.cfg.max_in_flight),
            timing,
            converter,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn start(&self) -> Result<()> {
        match self.state.transition(SessionState::Created, SessionState::Started) {
            Ok(()) => {}
            Err(SessionState::Stopped) => {
                if let Some(ring) = self.ring.lock().as_ref() {
                    ring.block().reset();
                }
                self.events_q.reset();
                self.state.set(SessionState::Started);
            }
            Err(SessionState::Started) => return Ok(()),
            Err(other) => {
                return Err(TransportError::InvalidArgument(format!(
                    "cannot start from {}",
                    other.name()
                )))
            }
        }
        tracing::info!(session = self.id, "rx session started");
        Ok(())
    }

    /// Stop the session. Async-signal-safe and idempotent; every blocked
    /// caller returns `TryAgain` within one wakeup.
    pub fn stop(&self) {
        self.state.set(SessionState::Stopped);
        if let Some(ring) = self.ring.lock().as_ref() {
            ring.stop();
        }
        self.events_q.stop();
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Started => Ok(()),
            _ => Err(TransportError::TryAgain),
        }
    }

    fn tally<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(TransportError::BadState { .. }) = &r {
            self.stats.lock().bad_state += 1;
        }
        r
    }

    fn emit_event(&self, ev: SessionEvent) {
        self.events.event(&ev);
        self.events_q.push(ev);
    }

    /// Take the next delivered frame, blocking up to `timeout` when
    /// configured.
    pub fn get_frame(&self, timeout: Duration) -> Result<RxFrame> {
        self.ensure_started()?;
        self.stats.lock().get_frame_try += 1;
        let ring = self
            .ring
            .lock()
            .clone()
            .ok_or(TransportError::Busy)?;
        let user = ring.get_converted(timeout)?;
        self.stats.lock().get_frame_succ += 1;
        trace::frame_get(self.id, user.index, user.frame.data.as_slice().as_ptr() as usize);
        Ok(RxFrame {
            slot: user.index,
            frame: user.frame,
            user_meta: user.user_meta,
        })
    }

    /// Return a consumed frame's slot to the ring.
    pub fn put_frame(&self, rxf: RxFrame) -> Result<()> {
        let ring = self
            .ring
            .lock()
            .clone()
            .ok_or(TransportError::Busy)?;
        let addr = rxf.frame.data.as_slice().as_ptr() as usize;
        self.tally(ring.put_free(rxf.slot, rxf.frame))?;
        self.stats.lock().put_frame += 1;
        trace::frame_put(self.id, rxf.slot, addr, "free");
        Ok(())
    }

    /// Pop the next session event, waiting up to `timeout`.
    pub fn event_poll(&self, timeout: Duration) -> Result<SessionEvent> {
        self.events_q.poll(timeout)
    }

    /// One worker pass: drain every port's queue through the
    /// depacketizer.
    pub fn poll(&self) -> PollStatus {
        if self.state.get() != SessionState::Started {
            return PollStatus::Idle;
        }
        let mut eng = self.engine.lock();
        let mut total = 0usize;
        for port in 0..eng.queues.len() {
            let pkts = eng.queues[port].rx_burst(128);
            for pkt in pkts {
                total += 1;
                self.handle_packet(&mut eng, port, pkt);
            }
        }
        if total == 0 {
            PollStatus::Idle
        } else {
            PollStatus::Received { pkts: total }
        }
    }

    fn handle_packet(&self, eng: &mut RxEngine, port: usize, pkt: RxPacket) {
        let parsed = match ParsedPacket::parse(&pkt.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(session = self.id, error = %e, "undecodable packet");
                return;
            }
        };
        if parsed.rtp.payload_type != self.cfg.payload_type {
            tracing::trace!(
                session = self.id,
                pt = parsed.rtp.payload_type,
                "foreign payload type"
            );
            return;
        }
        self.stats.lock().pkts_received[port] += 1;

        // detection phase: watch the first whole frame, then build the ring
        if eng.pipeline.is_none() {
            let Some(detector) = eng.detector.as_mut() else {
                return;
            };
            let (pg_coverage, pg_size) = self.cfg.transport_fmt.to_pixel_format().pixel_group();
            let Some(meta) = detector.feed(&parsed, pg_coverage, pg_size) else {
                return;
            };
            tracing::info!(
                session = self.id,
                width = meta.width,
                height = meta.height,
                fps = ?meta.fps,
                interlaced = meta.interlaced,
                "format detected"
            );
            let reply = self.events.notify_detected(&meta);
            let capacity = reply.framebuff_cnt.unwrap_or(self.cfg.framebuff_cnt);
            match self.build_pipeline(&meta, capacity) {
                Ok(pipeline) => {
                    *self.ring.lock() = Some(pipeline.ring.clone());
                    eng.pipeline = Some(pipeline);
                    eng.detector = None;
                    self.emit_event(SessionEvent::FormatDetected(meta));
                }
                Err(e) => {
                    tracing::error!(session = self.id, error = %e, "detected format unusable");
                    self.emit_event(SessionEvent::FatalError);
                    self.stop();
                    return;
                }
            }
            // fall through: this packet opens the first delivered frame
        }
        let arrival = if pkt.timestamp_ns != 0 {
            pkt.timestamp_ns
        } else {
            self.clock.now_ns()
        };
        let Some(pipe) = eng.pipeline.as_mut() else {
            return;
        };
        self.ingest(pipe, port, &parsed, arrival);
    }

    fn ingest(&self, pipe: &mut RxPipeline, port: usize, parsed: &ParsedPacket<'_>, arrival: u64) {
        if let Some(timing) = pipe.timing.as_mut() {
            if let Some(report) = timing.on_packet(parsed.rtp.timestamp, arrival) {
                self.emit_event(SessionEvent::TimingReport(report));
            }
        }
        let ts = parsed.rtp.timestamp;
        loop {
            match pipe.depacketizer.ingest(port, parsed) {
                Ok(RxPacketOutcome::Stored { complete, marker }) => {
                    // delivery happens on the marker so the redundant port
                    // finishes its per-frame accounting first
                    let done = marker && (complete || self.cfg.receive_incomplete);
                    if done {
                        if let Some(asm) = pipe.depacketizer.finish(ts) {
                            self.publish(pipe, asm, arrival);
                        }
                    }
                    return;
                }
                Ok(RxPacketOutcome::Duplicate) => {
                    self.stats.lock().pkts_redundant += 1;
                    if parsed.rtp.marker && pipe.depacketizer.is_complete(ts) {
                        if let Some(asm) = pipe.depacketizer.finish(ts) {
                            self.publish(pipe, asm, arrival);
                        }
                    }
                    return;
                }
                Ok(RxPacketOutcome::Stale) => {
                    self.stats.lock().pkts_out_of_order += 1;
                    return;
                }
                Ok(RxPacketOutcome::NeedsSlot) => {
                    let Some(job) = pipe.ring.begin_receive() else {
                        // ring exhausted: the consumer is not keeping up
                        self.stats.lock().buffers_dropped += 1;
                        return;
                    };
                    trace::frame_next(self.id, job.index, 0);
                    if let Some(evicted) = pipe.depacketizer.track(ts, job) {
                        self.evict(pipe, evicted, arrival);
                    }
                    // a new frame began: flush older frames whose marker
                    // was lost but whose coverage is full
                    while let Some(asm) = pipe.depacketizer.take_flushable(ts) {
                        self.publish(pipe, asm, arrival);
                    }
                    // retry now that the timestamp is tracked
                }
                Err(e) => {
                    tracing::debug!(session = self.id, error = %e, "packet outside frame bounds");
                    return;
                }
            }
        }
    }

    /// An assembly was pushed out while still in flight.
    fn evict(&self, pipe: &RxPipeline, asm: crate::codec::depacketizer::Assembly, arrival: u64) {
        if asm.complete(&pipe.geometry) || (self.cfg.receive_incomplete && asm.pkts_distinct() > 0)
        {
            self.publish(pipe, asm, arrival);
        } else {
            self.stats.lock().buffers_dropped += 1;
            trace::frame_drop(self.id, asm.job.index, asm.rtp_timestamp);
            pipe.ring.abandon_receive(asm.job.index, asm.job.frame);
        }
    }

    fn publish(&self, pipe: &RxPipeline, asm: crate::codec::depacketizer::Assembly, arrival: u64) {
        let slot = asm.job.index;
        let status = asm.status(&pipe.geometry);
        let mut frame = asm.job.frame;
        frame.rtp_timestamp = asm.rtp_timestamp;
        frame.timestamp_ns = arrival;
        frame.status = status;
        frame.pkts_total = pipe.geometry.total_pkts;
        frame.second_field = asm.second_field;
        for (dst, src) in frame.pkts_recv.iter_mut().zip(asm.pkts_recv.iter()) {
            *dst = *src;
        }

        if self
            .tally(pipe.ring.publish_received(slot, frame, None))
            .is_err()
        {
            return;
        }
        {
            let mut stats = self.stats.lock();
            stats.buffers_processed += 1;
            stats.bytes_processed += pipe.geometry.frame_bytes() as u64;
        }

        match &pipe.converter {
            ConverterBinding::Derive => {
                if self.tally(pipe.ring.promote_ready_derive(slot)).is_ok() {
                    trace::frame_available(self.id, slot, asm.rtp_timestamp);
                    self.events.frame_available();
                }
            }
            ConverterBinding::Internal(convert) => {
                let Some(job) = pipe.ring.begin_convert() else {
                    return;
                };
                let mut surface = job.surface;
                let wire = job.wire;
                sync_frame_meta(&wire, &mut surface);
                let ok = convert(&wire, &mut surface).is_ok();
                if self
                    .tally(pipe.ring.finish_convert(job.index, surface, wire, ok))
                    .is_ok()
                    && ok
                {
                    pipe.ring.block().wake_all();
                    trace::frame_available(self.id, job.index, asm.rtp_timestamp);
                    self.events.frame_available();
                } else if !ok {
                    self.stats.lock().convert_fail += 1;
                }
            }
            ConverterBinding::Plugin(converter) => {
                converter.notify_frame_ready();
            }
        }
    }

    /// Counter snapshot with ring occupancy folded in.
    pub fn stats(&self) -> SessionStats {
        let snapshot = *self.stats.lock();
        match self.ring.lock().as_ref() {
            Some(ring) => snapshot.with_occupancy(&ring.occupancy()),
            None => snapshot,
        }
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    /// Aggregate timing-parser verdicts so far.
    pub fn timing_summary(&self) -> Option<crate::session::timing::TimingSummary> {
        let eng = self.engine.lock();
        eng.pipeline
            .as_ref()
            .and_then(|p| p.timing.as_ref())
            .map(|t| t.summary())
    }

    /// Emit the periodic dump line.
    pub fn dump_stats(&self) {
        let occ = self
            .ring
            .lock()
            .as_ref()
            .map(|r| r.occupancy())
            .unwrap_or_default();
        stats::dump("RX_ST20", self.id, &self.name, &occ, &self.stats());
    }

    /// Tear the session down: abandon in-flight assemblies, report
    /// stragglers, detach the converter.
    pub fn destroy(self) {
        self.stop();
        let mut eng = self.engine.lock();
        if let Some(pipe) = eng.pipeline.as_mut() {
            for asm in pipe.depacketizer.drain() {
                pipe.ring.abandon_receive(asm.job.index, asm.job.frame);
            }
            for (slot, state) in pipe.ring.stragglers() {
                tracing::warn!(session = self.id, slot, state, "slot busy at destroy");
            }
        }
        drop(eng);
        self.instance.converters.detach(self.id);
        self.state.set(SessionState::Destroyed);
        tracing::info!(session = self.id, "rx session destroyed");
    }
}
