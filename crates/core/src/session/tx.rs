//! Transmit pipeline session.
//!
//! The producer side of the engine: the application claims a frame slot,
//! writes pixels (or installs an external buffer), and puts it back; the
//! worker's `poll()` dequeues the newest converted frame per epoch,
//! packetizes it, and hands the burst to the NIC with launch times from
//! the pacer.
//!
//! Frame completion is deferred one epoch: the wire buffer of the last
//! transmitted frame is retained so the stream can repeat it when the
//! producer falls behind (drop-on-late unset). With drop-on-late set the
//! slot recycles immediately and missed epochs surface through the
//! `frame_late` callback and the `epochs_missed` counter instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::packet::{PKT_MAX_UDP_BYTES, RTP_HDR_SIZE};
use crate::codec::{PacketGeometry, Packetizer, PackingMode};
use crate::convert::{
    ConvertRequest, ConvertSource, ConvertTask, ConverterSession, Device, Selection,
};
use crate::error::{Result, TransportError};
use crate::frame::ring::{FrameRing, RingConfig, WireJob};
use crate::frame::{ExtFrame, Fps, Frame, FrameData, PixelFormat, TransportFormat};
use crate::instance::Instance;
use crate::pacing::{FrameSchedule, Pacer, PacingConfig, PacingMethod, PacingParams, PacingProfile};
use crate::rtcp::{NackPacket, RetransmitBuffer};
use crate::session::{EventQueue, PollStatus, SessionEvent, SessionState, StateCell};
use crate::stats::{self, trace, SessionStats};
use crate::transport::{NicQueue, PtpClock, TxPacket};

/// Completion notification for one transmitted (or dropped) frame.
#[derive(Debug)]
pub struct FrameDone {
    pub session: u64,
    pub slot: usize,
    pub rtp_timestamp: u32,
    pub timestamp_ns: u64,
    pub epoch: u64,
    /// The external buffer handed back, zero-copy mode only.
    pub ext_buf: Option<(Vec<u8>, u64)>,
}

/// Application callbacks. All run on the worker thread and must not block.
pub trait TxEvents: Send + Sync {
    /// A `Free` slot appeared; edge-trigger for `get_frame`.
    fn frame_available(&self) {}
    /// Transmission (or supersession) of a frame finished; fires exactly
    /// once per frame.
    fn frame_done(&self, _done: FrameDone) {}
    /// An epoch passed without a frame on the wire.
    fn frame_late(&self, _epoch_skipped: u64) {}
    fn event(&self, _event: &SessionEvent) {}
}

/// Default no-op callback set for applications that poll.
pub struct NullTxEvents;
impl TxEvents for NullTxEvents {}

/// A frame slot loaned to the producer.
#[derive(Debug)]
pub struct TxFrame {
    pub slot: usize,
    pub seq: u32,
    pub frame: Frame,
    /// Metadata to ride with the frame; bounded by the per-slot buffer.
    pub user_meta: Option<Vec<u8>>,
}

/// Transmit session configuration.
#[derive(Clone)]
pub struct VideoTxConfig {
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub interlaced: bool,
    /// Application surface format.
    pub input_fmt: PixelFormat,
    /// On-wire ST 2110-20 format.
    pub transport_fmt: TransportFormat,
    pub packing: PackingMode,
    pub pacing_profile: PacingProfile,
    pub pacing_method: PacingMethod,
    pub payload_type: u8,
    /// Explicit SSRC; derived per RFC 3550 §8.1 when absent.
    pub ssrc: Option<u32>,
    pub framebuff_cnt: usize,
    pub device: Device,
    /// `get_frame` may park on the session condvar.
    pub blocking_get: bool,
    pub block_timeout: Duration,
    /// Recycle the slot when its epoch is missed instead of repeating the
    /// frame.
    pub drop_on_late: bool,
    /// Buffers are caller-provided via `put_ext_frame`.
    pub external_frames: bool,
    /// Honor the frame's `timestamp_ns` as its epoch.
    pub user_pacing: bool,
    /// Honor the frame's `rtp_timestamp` instead of deriving it.
    pub user_timestamp: bool,
    pub enable_vsync: bool,
    pub enable_rtcp: bool,
    /// Frames of packets retained for NACK resend.
    pub rtcp_retain_frames: usize,
    pub link_rate_bps: u64,
    pub start_vrx_bits: i64,
}

impl Default for VideoTxConfig {
    fn default() -> Self {
        VideoTxConfig {
            name: None,
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            interlaced: false,
            input_fmt: PixelFormat::Yuv422Planar10Le,
            transport_fmt: TransportFormat::Yuv422_10bit,
            packing: PackingMode::BlockPacking,
            pacing_profile: PacingProfile::Narrow,
            pacing_method: PacingMethod::Tsn,
            payload_type: 112,
            ssrc: None,
            framebuff_cnt: 4,
            device: Device::Auto,
            blocking_get: false,
            block_timeout: Duration::from_secs(1),
            drop_on_late: false,
            external_frames: false,
            user_pacing: false,
            user_timestamp: false,
            enable_vsync: false,
            enable_rtcp: false,
            rtcp_retain_frames: 2,
            link_rate_bps: 10_000_000_000,
            start_vrx_bits: 0,
        }
    }
}

pub(crate) enum ConverterBinding {
    /// Surface format equals the wire format; no conversion stage.
    Derive,
    /// Built-in scalar kernel, run inline in `put_frame`.
    Internal(crate::convert::ConvertFn),
    /// External plugin, pumped through [`RingConvertSource`].
    Plugin(Arc<dyn ConverterSession>),
}

/// Worker-side mutable state, locked once per `poll`.
struct TxEngine {
    pacer: Pacer,
    packetizer: Packetizer,
    queue: Box<dyn NicQueue>,
    /// Last transmitted frame, kept out of the ring for repeats.
    retained: Option<WireJob>,
    armed: Option<FrameSchedule>,
    streaming: bool,
    last_field_ts: Option<u32>,
    rtcp: Option<RetransmitBuffer>,
}

/// The converter-facing side of a session ring.
///
/// Converter sessions hold this instead of a session back-pointer, so a
/// media session can be destroyed without a cycle: the source only keys
/// into the ring.
pub(crate) struct RingConvertSource {
    pub ring: Arc<FrameRing>,
    /// Receive direction: the wire frame is the conversion source.
    pub rx: bool,
    pub stats: Arc<Mutex<SessionStats>>,
    pub on_fail: Box<dyn Fn() + Send + Sync>,
}

impl ConvertSource for RingConvertSource {
    fn get_frame(&self) -> Option<ConvertTask> {
        let job = self.ring.begin_convert()?;
        let (src, dst) = if self.rx {
            (job.wire, job.surface)
        } else {
            (job.surface, job.wire)
        };
        Some(ConvertTask {
            slot: job.index,
            src,
            dst,
        })
    }

    fn put_frame(&self, task: ConvertTask, result: Result<()>) {
        let ok = result.is_ok();
        let (mut surface, mut wire) = if self.rx {
            (task.dst, task.src)
        } else {
            (task.src, task.dst)
        };
        // the converted side inherits the produced side's identity
        if self.rx {
            sync_frame_meta(&wire, &mut surface);
        } else {
            sync_frame_meta(&surface, &mut wire);
        }
        if let Err(e) = self.ring.finish_convert(task.slot, surface, wire, ok) {
            tracing::warn!(error = %e, "convert completion on bad slot");
            self.stats.lock().bad_state += 1;
            return;
        }
        if !ok {
            self.stats.lock().convert_fail += 1;
            (self.on_fail)();
        }
    }
}

/// Carry frame identity across the surface/wire pair of a slot.
pub(crate) fn sync_frame_meta(src: &Frame, dst: &mut Frame) {
    dst.second_field = src.second_field;
    dst.rtp_timestamp = src.rtp_timestamp;
    dst.timestamp_ns = src.timestamp_ns;
    dst.status = src.status;
    dst.pkts_total = src.pkts_total;
    dst.pkts_recv = src.pkts_recv;
    dst.opaque = src.opaque;
}

/// ST 2110-20 transmit session.
pub struct VideoTx {
    id: u64,
    name: String,
    state: StateCell,
    cfg: VideoTxConfig,
    ring: Arc<FrameRing>,
    engine: Mutex<TxEngine>,
    clock: Arc<dyn PtpClock>,
    events: Arc<dyn TxEvents>,
    events_q: EventQueue,
    stats: Arc<Mutex<SessionStats>>,
    second_field: Mutex<bool>,
    converter: ConverterBinding,
    instance: Arc<Instance>,
    src_size: usize,
}

impl VideoTx {
    pub fn new(
        instance: Arc<Instance>,
        clock: Arc<dyn PtpClock>,
        queue: Box<dyn NicQueue>,
        events: Arc<dyn TxEvents>,
        cfg: VideoTxConfig,
    ) -> Result<Self> {
        if cfg.payload_type > 127 {
            return Err(TransportError::InvalidArgument(format!(
                "payload type {} exceeds 7 bits",
                cfg.payload_type
            )));
        }
        let wire_fmt = cfg.transport_fmt.to_pixel_format();
        let geometry = PacketGeometry::new(cfg.packing, wire_fmt, cfg.width, cfg.height, cfg.interlaced)?;
        let derive = cfg.input_fmt == wire_fmt;
        let src_size = cfg.input_fmt.frame_size(cfg.width, cfg.height, cfg.interlaced);
        if src_size == 0 {
            return Err(TransportError::InvalidArgument("zero source frame size".into()));
        }

        let id = instance.next_session_id();
        let name = cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("ST20_TX_{id}"));

        let ring = Arc::new(FrameRing::new(RingConfig {
            capacity: cfg.framebuff_cnt,
            surface_fmt: cfg.input_fmt,
            wire_fmt,
            width: cfg.width,
            height: cfg.height,
            interlaced: cfg.interlaced,
            derive,
            external: cfg.external_frames,
            blocking_get: cfg.blocking_get,
            user_meta_capacity: PKT_MAX_UDP_BYTES - RTP_HDR_SIZE,
        })?);
        let stats = Arc::new(Mutex::new(SessionStats::default()));

        let converter = if derive {
            ConverterBinding::Derive
        } else {
            let req = ConvertRequest {
                input: cfg.input_fmt,
                output: wire_fmt,
                width: cfg.width,
                height: cfg.height,
                fps: cfg.fps,
                interlaced: cfg.interlaced,
                framebuff_cnt: cfg.framebuff_cnt,
                device: cfg.device,
            };
            match instance.converters.select(&req)? {
                Selection::Internal(f) => ConverterBinding::Internal(f),
                Selection::Plugin(plugin) => {
                    let events_for_fail = events.clone();
                    let source = Arc::new(RingConvertSource {
                        ring: ring.clone(),
                        rx: false,
                        stats: stats.clone(),
                        on_fail: Box::new(move || events_for_fail.frame_available()),
                    });
                    let session = plugin.create(&req, source)?;
                    instance.converters.attach(id, &session);
                    ConverterBinding::Plugin(session)
                }
            }
        };

        let pacer = Pacer::new(&PacingConfig {
            profile: cfg.pacing_profile,
            method: cfg.pacing_method,
            fps: cfg.fps,
            height: cfg.height,
            interlaced: cfg.interlaced,
            total_pkts: geometry.total_pkts,
            link_rate_bps: cfg.link_rate_bps,
            start_vrx_bits: cfg.start_vrx_bits,
        })?;
        let ssrc = cfg.ssrc.unwrap_or_else(Packetizer::random_ssrc);
        let packetizer = Packetizer::new(geometry, cfg.payload_type, ssrc);
        let rtcp = cfg
            .enable_rtcp
            .then(|| RetransmitBuffer::new(cfg.rtcp_retain_frames));

        tracing::info!(
            session = id,
            name = %name,
            fmt = cfg.input_fmt.name(),
            transport = cfg.transport_fmt.name(),
            packing = cfg.packing.name(),
            derive,
            pkts = geometry.total_pkts,
            "tx session created"
        );

        Ok(VideoTx {
            id,
            name,
            state: StateCell::new(),
            cfg,
            ring,
            engine: Mutex::new(TxEngine {
                pacer,
                packetizer,
                queue,
                retained: None,
                armed: None,
                streaming: false,
                last_field_ts: None,
                rtcp,
            }),
            clock,
            events,
            events_q: EventQueue::new(64),
            stats,
            second_field: Mutex::new(false),
            converter,
            instance,
            src_size,
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

    /// Source-side frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.src_size
    }

    /// Derived pacing values: `(TRO, TRS, VRX level)`.
    pub fn pacing_params(&self) -> PacingParams {
        self.engine.lock().pacer.params()
    }

    pub fn start(&self) -> Result<()> {
        match self.state.transition(SessionState::Created, SessionState::Started) {
            Ok(()) => {}
            Err(SessionState::Stopped) => {
                self.ring.block().reset();
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
        tracing::info!(session = self.id, "tx session started");
        if !self.cfg.blocking_get {
            self.events.frame_available();
        }
        Ok(())
    }

    /// Stop the session. Async-signal-safe: an atomic store plus condvar
    /// broadcasts, nothing else. Idempotent; blocked callers return
    /// `TryAgain` within one wakeup.
    pub fn stop(&self) {
        self.state.set(SessionState::Stopped);
        self.ring.stop();
        self.events_q.stop();
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Started => Ok(()),
            _ => Err(TransportError::TryAgain),
        }
    }

    /// Puts stay legal after `stop()` so loaned frames can drain back.
    fn ensure_not_destroyed(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Destroyed => Err(TransportError::TryAgain),
            _ => Ok(()),
        }
    }

    fn tally<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(TransportError::BadState { .. }) = &r {
            self.stats.lock().bad_state += 1;
        }
        r
    }

    /// Claim a free slot, blocking up to `timeout` when configured.
    pub fn get_frame(&self, timeout: Duration) -> Result<TxFrame> {
        self.ensure_started()?;
        self.stats.lock().get_frame_try += 1;
        let user = self.ring.get_free(timeout)?;
        let mut tf = TxFrame {
            slot: user.index,
            seq: user.seq,
            frame: user.frame,
            user_meta: None,
        };
        if self.cfg.interlaced {
            let mut sf = self.second_field.lock();
            tf.frame.second_field = *sf;
            *sf = !*sf;
        }
        self.stats.lock().get_frame_succ += 1;
        trace::frame_get(self.id, tf.slot, tf.frame.data.as_slice().as_ptr() as usize);
        Ok(tf)
    }

    /// Hand a written frame to the pipeline.
    pub fn put_frame(&self, tf: TxFrame) -> Result<()> {
        self.ensure_not_destroyed()?;
        if self.cfg.external_frames {
            return Err(TransportError::InvalidArgument(
                "external-frame session, use put_ext_frame".into(),
            ));
        }
        self.finish_put(tf)
    }

    /// Hand in a frame whose pixels live in a caller-owned buffer. The
    /// buffer comes back through `frame_done` exactly once.
    pub fn put_ext_frame(&self, mut tf: TxFrame, ext: ExtFrame) -> Result<()> {
        self.ensure_not_destroyed()?;
        if !self.cfg.external_frames {
            return Err(TransportError::InvalidArgument(
                "session not in external-frame mode".into(),
            ));
        }
        install_ext(&mut tf.frame, ext)?;
        self.finish_put(tf)
    }

    fn finish_put(&self, mut tf: TxFrame) -> Result<()> {
        let slot = tf.slot;
        let meta = tf.user_meta.take();
        let addr = tf.frame.data.as_slice().as_ptr() as usize;
        match &self.converter {
            ConverterBinding::Derive => {
                self.tally(self.ring.put_converted(slot, tf.frame, meta.as_deref()))?;
            }
            ConverterBinding::Internal(convert) => {
                let mut wire = self.tally(self.ring.take_wire(slot))?;
                sync_frame_meta(&tf.frame, &mut wire);
                match convert(&tf.frame, &mut wire) {
                    Ok(()) => {
                        self.tally(self.ring.put_converted_pair(
                            slot,
                            tf.frame,
                            wire,
                            meta.as_deref(),
                        ))?;
                    }
                    Err(e) => {
                        tracing::debug!(session = self.id, slot, error = %e, "inline convert failed");
                        self.ring.put_failed(slot, tf.frame, wire);
                        self.stats.lock().convert_fail += 1;
                        self.events.frame_available();
                        return Err(TransportError::ConvertFail);
                    }
                }
            }
            ConverterBinding::Plugin(session) => {
                self.tally(self.ring.put_ready(slot, tf.frame, meta.as_deref()))?;
                session.notify_frame_ready();
            }
        }
        self.stats.lock().put_frame += 1;
        trace::frame_put(self.id, slot, addr, "queued");
        Ok(())
    }

    /// Pop the next session event, waiting up to `timeout`.
    pub fn event_poll(&self, timeout: Duration) -> Result<SessionEvent> {
        self.events_q.poll(timeout)
    }

    fn emit_event(&self, ev: SessionEvent) {
        self.events.event(&ev);
        self.events_q.push(ev);
    }

    /// Answer an RFC 4585 Generic NACK by resending retained packets.
    pub fn handle_nack(&self, rtcp: &[u8]) -> Result<u32> {
        let nack = NackPacket::parse(rtcp)?;
        let mut eng = self.engine.lock();
        let resend = {
            let Some(buffer) = &eng.rtcp else {
                return Err(TransportError::InvalidArgument("rtcp not enabled".into()));
            };
            buffer.resend_for(&nack)
        };
        let n = resend.len() as u32;
        let mut pkts: Vec<TxPacket> = resend
            .into_iter()
            .map(|data| TxPacket {
                data,
                launch_time_ns: 0,
            })
            .collect();
        while !pkts.is_empty() {
            if eng.queue.tx_burst(&mut pkts) == 0 {
                std::hint::spin_loop();
            }
        }
        self.stats.lock().pkts_retransmitted += n as u64;
        tracing::debug!(session = self.id, pkts = n, "nack retransmit");
        Ok(n)
    }

    /// One worker pass: arm the next epoch, and when its launch window
    /// opens, transmit the newest converted frame (or repeat, or report a
    /// miss).
    pub fn poll(&self) -> PollStatus {
        if self.state.get() != SessionState::Started {
            return PollStatus::Idle;
        }
        let mut eng = self.engine.lock();
        let now = self.clock.now_ns();

        if eng.armed.is_none() {
            if !eng.streaming && !self.ring.has_converted() {
                return PollStatus::Idle;
            }
            let sched = eng.pacer.claim_epoch(now);
            if self.cfg.enable_vsync {
                self.emit_event(SessionEvent::VSync { epoch: sched.epoch });
            }
            eng.armed = Some(sched);
        }
        let Some(sched) = eng.armed else {
            return PollStatus::Idle;
        };
        if now < sched.first_tx_ns {
            return PollStatus::Waiting {
                next_ns: sched.first_tx_ns,
            };
        }
        eng.armed = None;

        if eng.pacer.is_late(sched.epoch, now) {
            return self.miss_epoch(&mut eng, sched.epoch);
        }

        match self.ring.begin_transmit_newest() {
            Some(job) => self.transmit(&mut eng, sched, job),
            None => {
                if !eng.streaming {
                    return PollStatus::Idle;
                }
                if !self.cfg.drop_on_late {
                    if let Some(job) = eng.retained.take() {
                        return self.repeat(&mut eng, sched, job);
                    }
                }
                self.miss_epoch(&mut eng, sched.epoch)
            }
        }
    }

    fn miss_epoch(&self, eng: &mut TxEngine, epoch: u64) -> PollStatus {
        if !eng.streaming {
            return PollStatus::Idle;
        }
        self.stats.lock().epochs_missed += 1;
        if self.cfg.drop_on_late {
            if let Some((slot, rtp)) = self.ring.drop_late() {
                self.stats.lock().buffers_dropped += 1;
                trace::frame_drop(self.id, slot, rtp);
                self.finish_slot(slot, rtp, 0, epoch);
            }
        }
        self.events.frame_late(epoch);
        PollStatus::Late { epoch }
    }

    fn transmit(&self, eng: &mut TxEngine, sched: FrameSchedule, mut job: WireJob) -> PollStatus {
        // older converted frames were superseded; recycle them
        while let Some((slot, rtp)) = self.ring.drop_late() {
            self.stats.lock().buffers_dropped += 1;
            trace::frame_drop(self.id, slot, rtp);
            self.finish_slot(slot, rtp, 0, sched.epoch);
        }
        if let Some(prev) = eng.retained.take() {
            self.retire(prev);
        }

        let sched = if self.cfg.user_pacing && job.frame.timestamp_ns > 0 {
            eng.pacer.claim_epoch(job.frame.timestamp_ns)
        } else {
            sched
        };

        let mut rtp_ts = if self.cfg.user_timestamp {
            job.frame.rtp_timestamp
        } else {
            sched.rtp_timestamp
        };
        if self.cfg.interlaced {
            if job.frame.second_field {
                rtp_ts = eng.last_field_ts.unwrap_or(rtp_ts);
            } else {
                eng.last_field_ts = Some(rtp_ts);
            }
        }
        job.frame.rtp_timestamp = rtp_ts;
        job.frame.timestamp_ns = sched.epoch_start_ns;
        job.frame.epoch = sched.epoch;

        trace::frame_next(self.id, job.index, sched.epoch);
        let pkts = self.emit(eng, &sched, &job.frame);

        if self.cfg.drop_on_late {
            // no repeats wanted: release the slot right away
            self.retire(job);
        } else {
            eng.retained = Some(job);
        }
        eng.streaming = true;
        PollStatus::Sent {
            epoch: sched.epoch,
            pkts,
        }
    }

    /// Repeat the retained frame to hold stream cadence.
    fn repeat(&self, eng: &mut TxEngine, sched: FrameSchedule, mut job: WireJob) -> PollStatus {
        job.frame.rtp_timestamp = sched.rtp_timestamp;
        job.frame.timestamp_ns = sched.epoch_start_ns;
        job.frame.epoch = sched.epoch;
        let pkts = self.emit(eng, &sched, &job.frame);
        tracing::trace!(session = self.id, slot = job.index, epoch = sched.epoch, "frame repeated");
        eng.retained = Some(job);
        PollStatus::Sent {
            epoch: sched.epoch,
            pkts,
        }
    }

    fn emit(&self, eng: &mut TxEngine, sched: &FrameSchedule, frame: &Frame) -> u32 {
        let cap = eng.packetizer.max_packet_bytes();
        let spin = eng.pacer.method() == PacingMethod::Tsc;
        let mut retained_pkts: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut batch: Vec<TxPacket> = Vec::new();
        let mut sent = 0u32;
        let mut buf = vec![0u8; cap];

        // split borrows: the cursor holds the packetizer, pacing math the rest
        let TxEngine {
            packetizer,
            pacer,
            queue,
            rtcp,
            ..
        } = eng;
        let mut cursor = packetizer.start_frame(frame, frame.rtp_timestamp);
        while let Some(desc) = cursor.next_into(&mut buf) {
            let launch = pacer.launch_time(sched, desc.index);
            if spin && launch > 0 {
                while self.clock.now_ns() < launch {
                    std::hint::spin_loop();
                }
            }
            pacer.vrx_account(desc.len);
            if rtcp.is_some() {
                retained_pkts.push((desc.sequence as u16, buf[..desc.len].to_vec()));
            }
            batch.push(TxPacket {
                data: buf[..desc.len].to_vec(),
                launch_time_ns: launch,
            });
            sent += 1;
            if batch.len() >= 64 {
                drain_burst(queue.as_mut(), &mut batch);
            }
        }
        drain_burst(queue.as_mut(), &mut batch);
        if let Some(rtcp) = rtcp {
            rtcp.push_frame(retained_pkts);
        }
        let mut stats = self.stats.lock();
        stats.bytes_processed += frame.data_size as u64;
        sent
    }

    /// Release a transmitted frame's slot and notify the application.
    fn retire(&self, job: WireJob) {
        let slot = job.index;
        let rtp = job.frame.rtp_timestamp;
        let ts_ns = job.frame.timestamp_ns;
        let epoch = job.frame.epoch;
        let mut frame = job.frame;
        let ext_buf = take_ext(&mut frame);
        let res = self.tally(self.ring.complete(slot, frame));
        if let Err(e) = res {
            tracing::warn!(session = self.id, slot, error = %e, "transmit completion on bad slot");
        }
        self.stats.lock().buffers_processed += 1;
        trace::frame_done(self.id, slot, rtp);
        if !self.ring.mark_done_fired(slot) {
            self.events.frame_done(FrameDone {
                session: self.id,
                slot,
                rtp_timestamp: rtp,
                timestamp_ns: ts_ns,
                epoch,
                ext_buf,
            });
        }
        self.events.frame_available();
    }

    /// Frame-done bookkeeping for a slot recycled in place (late drop).
    fn finish_slot(&self, slot: usize, rtp: u32, ts_ns: u64, epoch: u64) {
        let ext_buf = self.ring.take_external(slot);
        if !self.ring.mark_done_fired(slot) {
            self.events.frame_done(FrameDone {
                session: self.id,
                slot,
                rtp_timestamp: rtp,
                timestamp_ns: ts_ns,
                epoch,
                ext_buf,
            });
        }
        self.events.frame_available();
    }

    /// Counter snapshot with ring occupancy folded in.
    pub fn stats(&self) -> SessionStats {
        let snapshot = *self.stats.lock();
        snapshot.with_occupancy(&self.ring.occupancy())
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    /// Emit the periodic dump line.
    pub fn dump_stats(&self) {
        stats::dump(
            "TX_ST20",
            self.id,
            &self.name,
            &self.ring.occupancy(),
            &self.stats(),
        );
    }

    /// Tear the session down: flush retained frames, report stragglers,
    /// detach the converter.
    pub fn destroy(self) {
        self.stop();
        if let Some(job) = self.engine.lock().retained.take() {
            self.retire(job);
        }
        while let Some((slot, rtp)) = self.ring.drop_late() {
            self.finish_slot(slot, rtp, 0, 0);
        }
        // give an in-flight conversion a bounded window to finish
        for _ in 0..100 {
            if !self
                .ring
                .stragglers()
                .iter()
                .any(|(_, s)| *s == "in_converting")
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        while let Some((slot, rtp)) = self.ring.drop_late() {
            self.finish_slot(slot, rtp, 0, 0);
        }
        for (slot, state) in self.ring.stragglers() {
            tracing::warn!(session = self.id, slot, state, "slot busy at destroy");
        }
        self.instance.converters.detach(self.id);
        self.state.set(SessionState::Destroyed);
        tracing::info!(session = self.id, "tx session destroyed");
    }
}

fn drain_burst(queue: &mut dyn NicQueue, batch: &mut Vec<TxPacket>) {
    while !batch.is_empty() {
        if queue.tx_burst(batch) == 0 {
            std::hint::spin_loop();
        }
    }
}

fn install_ext(frame: &mut Frame, ext: ExtFrame) -> Result<()> {
    frame.buffer_size = ext.buf.len();
    frame.data_size = ext.buf.len();
    frame.data = FrameData::External {
        buf: ext.buf,
        iova: ext.iova,
    };
    if ext.linesize[0] != 0 {
        frame.plane_offset = ext.plane_offset;
        frame.linesize = ext.linesize;
    } else {
        frame.init_planes();
    }
    frame.sanity_check()
}

fn take_ext(frame: &mut Frame) -> Option<(Vec<u8>, u64)> {
    if !frame.data.is_external() {
        return None;
    }
    match std::mem::replace(&mut frame.data, FrameData::Unset) {
        FrameData::External { buf, iova } => {
            frame.buffer_size = 0;
            frame.data_size = 0;
            Some((buf, iova))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackNic, LoopbackRx};
    use crate::transport::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingEvents {
        late: Mutex<Vec<u64>>,
        done: Mutex<Vec<FrameDone>>,
        available: AtomicUsize,
    }

    impl TxEvents for RecordingEvents {
        fn frame_available(&self) {
            self.available.fetch_add(1, Ordering::Relaxed);
        }
        fn frame_done(&self, done: FrameDone) {
            self.done.lock().push(done);
        }
        fn frame_late(&self, epoch: u64) {
            self.late.lock().push(epoch);
        }
    }

    fn small_cfg(drop_on_late: bool) -> VideoTxConfig {
        VideoTxConfig {
            width: 256,
            height: 16,
            fps: Fps::P60,
            // derive mode: surface is the wire format
            input_fmt: PixelFormat::Yuv422Rfc4175Be10,
            drop_on_late,
            framebuff_cnt: 3,
            ssrc: Some(0x1234),
            ..Default::default()
        }
    }

    struct Harness {
        tx: VideoTx,
        clock: Arc<ManualClock>,
        rx: LoopbackRx,
        events: Arc<RecordingEvents>,
    }

    fn harness(cfg: VideoTxConfig) -> Harness {
        let clock = ManualClock::new(0);
        let (tx_q, rx_q) = LoopbackNic::pair();
        let events = Arc::new(RecordingEvents::default());
        let tx = VideoTx::new(
            Instance::new(),
            clock.clone(),
            Box::new(tx_q),
            events.clone(),
            cfg,
        )
        .unwrap();
        tx.start().unwrap();
        Harness {
            tx,
            clock,
            rx: rx_q,
            events,
        }
    }

    fn produce(h: &Harness, fill: u8) {
        let mut tf = h.tx.get_frame(Duration::ZERO).unwrap();
        tf.frame.data.as_mut_slice().fill(fill);
        h.tx.put_frame(tf).unwrap();
    }

    /// Advance the clock to the armed launch window and emit.
    fn pump_one(h: &Harness) -> PollStatus {
        match h.tx.poll() {
            PollStatus::Waiting { next_ns } => {
                h.clock.set(next_ns);
                h.tx.poll()
            }
            other => other,
        }
    }

    #[test]
    fn derive_frame_reaches_nic_with_marker() {
        let mut h = harness(small_cfg(false));
        produce(&h, 0xAB);
        let status = pump_one(&h);
        let PollStatus::Sent { pkts, .. } = status else {
            panic!("expected Sent, got {status:?}");
        };
        let got = h.rx.rx_burst(usize::MAX);
        assert_eq!(got.len() as u32, pkts);
        let last = crate::codec::packet::ParsedPacket::parse(&got.last().unwrap().data).unwrap();
        assert!(last.rtp.marker);
        assert_eq!(last.rtp.payload_type, 112);
        assert_eq!(h.tx.stats().put_frame, 1);
    }

    #[test]
    fn rtp_timestamps_strictly_increase_across_frames() {
        let mut h = harness(small_cfg(true));
        let mut seen = Vec::new();
        for i in 0..3u8 {
            produce(&h, i);
            assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
            let got = h.rx.rx_burst(usize::MAX);
            let p = crate::codec::packet::ParsedPacket::parse(&got[0].data).unwrap();
            seen.push(p.rtp.timestamp);
        }
        assert!(seen.windows(2).all(|w| (w[1].wrapping_sub(w[0]) as i32) > 0));
    }

    #[test]
    fn stalled_producer_drop_on_late_counts_missed_epochs() {
        let mut h = harness(small_cfg(true));
        produce(&h, 1);
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        // frame done immediately in drop mode
        assert_eq!(h.events.done.lock().len(), 1);
        h.rx.rx_burst(usize::MAX);

        // producer stalls: run two more epochs with nothing converted
        for _ in 0..2 {
            match h.tx.poll() {
                PollStatus::Waiting { next_ns } => {
                    // blow past the launch window to miss the epoch
                    h.clock.set(next_ns + h.tx.pacing_params().trs_ns as u64 * 2);
                    assert!(matches!(h.tx.poll(), PollStatus::Late { .. }));
                }
                other => panic!("expected Waiting, got {other:?}"),
            }
        }
        assert_eq!(h.tx.stats().epochs_missed, 2);
        assert_eq!(h.events.late.lock().len(), 2);
        assert_eq!(h.rx.pending(), 0, "nothing retransmitted in drop mode");
    }

    #[test]
    fn stalled_producer_repeats_last_frame() {
        let mut h = harness(small_cfg(false));
        produce(&h, 7);
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let first: Vec<_> = h.rx.rx_burst(usize::MAX);
        // done deferred while the frame may repeat
        assert_eq!(h.events.done.lock().len(), 0);

        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let second: Vec<_> = h.rx.rx_burst(usize::MAX);
        assert_eq!(first.len(), second.len());
        let a = crate::codec::packet::ParsedPacket::parse(&first[0].data).unwrap();
        let b = crate::codec::packet::ParsedPacket::parse(&second[0].data).unwrap();
        assert_eq!(a.payload, b.payload, "same pixels repeated");
        assert!(b.rtp.timestamp != a.rtp.timestamp);
        assert_eq!(h.tx.stats().epochs_missed, 0);

        // a fresh frame retires the repeated one
        produce(&h, 9);
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        assert_eq!(h.events.done.lock().len(), 1);
    }

    #[test]
    fn newest_frame_wins_and_older_recycles() {
        let mut h = harness(small_cfg(false));
        produce(&h, 1);
        produce(&h, 2);
        produce(&h, 3);
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let got = h.rx.rx_burst(usize::MAX);
        let p = crate::codec::packet::ParsedPacket::parse(&got[0].data).unwrap();
        assert_eq!(p.payload[0], 3, "newest converted frame transmitted");
        // the two superseded frames were recycled
        assert_eq!(h.tx.stats().buffers_dropped, 2);
        assert_eq!(h.events.done.lock().len(), 2);
    }

    #[test]
    fn stop_unblocks_waiting_producer() {
        let mut cfg = small_cfg(false);
        cfg.blocking_get = true;
        cfg.framebuff_cnt = 1;
        let h = harness(cfg);
        let held = h.tx.get_frame(Duration::ZERO).unwrap();

        std::thread::scope(|scope| {
            let tx = &h.tx;
            let waiter = scope.spawn(move || tx.get_frame(Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(30));
            let t0 = std::time::Instant::now();
            h.tx.stop();
            match waiter.join().unwrap() {
                Err(TransportError::TryAgain) => {}
                other => panic!("expected TryAgain, got {other:?}"),
            }
            assert!(t0.elapsed() < Duration::from_millis(100));
        });
        drop(held);
        // stop is idempotent
        h.tx.stop();
        h.tx.stop();
        assert_eq!(h.tx.state(), SessionState::Stopped);
    }

    #[test]
    fn internal_convert_runs_inline() {
        let mut cfg = small_cfg(false);
        cfg.input_fmt = PixelFormat::Yuv422Planar10Le;
        let mut h = harness(cfg);
        let mut tf = h.tx.get_frame(Duration::ZERO).unwrap();
        assert_eq!(tf.frame.fmt, PixelFormat::Yuv422Planar10Le);
        // mid-gray in all planes
        for p in 0..3 {
            let plane = tf.frame.plane_mut(p);
            for pair in plane.chunks_exact_mut(2) {
                pair.copy_from_slice(&0x200u16.to_le_bytes());
            }
        }
        h.tx.put_frame(tf).unwrap();
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let got = h.rx.rx_burst(usize::MAX);
        let p = crate::codec::packet::ParsedPacket::parse(&got[0].data).unwrap();
        assert_eq!(&p.payload[..5], &[0x80, 0x20, 0x08, 0x02, 0x00]);
    }

    #[test]
    fn unsupported_conversion_fails_create() {
        let mut cfg = small_cfg(false);
        cfg.input_fmt = PixelFormat::Rgb8;
        let clock = ManualClock::new(0);
        let (tx_q, _rx_q) = LoopbackNic::pair();
        match VideoTx::new(
            Instance::new(),
            clock,
            Box::new(tx_q),
            Arc::new(NullTxEvents),
            cfg,
        ) {
            Err(TransportError::UnsupportedFormat(_)) => {}
            other => panic!("expected UnsupportedFormat, got {:?}", other.err()),
        }
    }

    #[test]
    fn ext_frame_buffer_returned_on_done() {
        let mut cfg = small_cfg(true);
        cfg.external_frames = true;
        let h = harness(cfg);
        let size = PixelFormat::Yuv422Rfc4175Be10.frame_size(256, 16, false);
        let tf = h.tx.get_frame(Duration::ZERO).unwrap();
        let ext = ExtFrame {
            buf: vec![0x5A; size],
            iova: 0xD0_0000,
            plane_offset: [0; 4],
            linesize: [0; 4],
        };
        h.tx.put_ext_frame(tf, ext).unwrap();
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let done = h.events.done.lock();
        assert_eq!(done.len(), 1);
        let (buf, iova) = done[0].ext_buf.as_ref().expect("ext buffer returned");
        assert_eq!(buf.len(), size);
        assert_eq!(*iova, 0xD0_0000);
    }

    #[test]
    fn nack_resends_retained_packets() {
        let mut cfg = small_cfg(true);
        cfg.enable_rtcp = true;
        let mut h = harness(cfg);
        produce(&h, 4);
        assert!(matches!(pump_one(&h), PollStatus::Sent { .. }));
        let sent = h.rx.rx_burst(usize::MAX);
        let first = crate::codec::packet::ParsedPacket::parse(&sent[0].data).unwrap();

        let nack = NackPacket::from_lost(1, 0x1234, &[first.rtp.sequence]);
        let resent = h.tx.handle_nack(&nack.write()).unwrap();
        assert_eq!(resent, 1);
        let again = h.rx.rx_burst(usize::MAX);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].data, sent[0].data);
        assert_eq!(h.tx.stats().pkts_retransmitted, 1);
    }
}
