//! Media pipeline sessions.
//!
//! A session owns a frame ring and mediates between the application's
//! frame cadence and the network's packet cadence:
//!
//! ```text
//! TX: app → ring → converter → packetizer → pacer → NIC queue
//! RX: NIC queue → depacketizer → ring → converter → app
//! ```
//!
//! Sessions never spawn threads. A cooperative worker (one per scheduling
//! domain, pinned by the host) repeatedly calls `poll()`; application
//! callbacks run on that worker and must not block. The only suspension
//! points are `get_frame(timeout)` and `event_poll(timeout)`, both backed
//! by the per-session [`BlockWake`](crate::sync::BlockWake).
//!
//! ## Lifecycle
//!
//! ```text
//! Created → Started → Stopped → Destroyed
//! ```
//!
//! `stop()` is async-signal-safe — one relaxed atomic store plus one
//! condvar broadcast — and idempotent; every blocked caller returns
//! `TryAgain` within one wakeup.

pub mod rx;
pub mod timing;
pub mod tx;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::depacketizer::DetectedMeta;
use crate::error::{Result, TransportError};
use crate::stats::SessionStats;
use crate::sync::{BlockWake, WaitOutcome};
pub use rx::{DetectReply, NullRxEvents, RxEvents, RxFrame, VideoRx, VideoRxConfig};
pub use timing::{TimingCompliance, TimingParser, TimingReport};
pub use tx::{FrameDone, NullTxEvents, TxEvents, TxFrame, VideoTx, VideoTxConfig};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Started,
            2 => SessionState::Stopped,
            _ => SessionState::Destroyed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Started => "started",
            SessionState::Stopped => "stopped",
            SessionState::Destroyed => "destroyed",
        }
    }
}

/// Atomic lifecycle cell shared across worker and application threads.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        StateCell(AtomicU8::new(0))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, s: SessionState) {
        self.0.store(s as u8, Ordering::Release);
    }

    /// Compare-and-set; returns the previous state on failure.
    pub fn transition(
        &self,
        from: SessionState,
        to: SessionState,
    ) -> std::result::Result<(), SessionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }
}

/// Asynchronous session events, delivered through callbacks and the
/// [`EventQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transmit epoch boundary passed.
    VSync { epoch: u64 },
    /// Unrecoverable failure; the session is now `Stopped`.
    FatalError,
    /// A recoverable anomaly was absorbed.
    RecoveryError,
    /// RX format auto-detection concluded.
    FormatDetected(DetectedMeta),
    /// Periodic RX timing-parser verdict.
    TimingReport(TimingReport),
}

/// Bounded event queue behind `event_poll`.
///
/// Sessions push events from the worker; applications that prefer polling
/// over callbacks drain them with a bounded wait. Overflow drops the
/// oldest event.
#[derive(Debug)]
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<SessionEvent>>,
    block: BlockWake,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            events: Mutex::new(VecDeque::new()),
            block: BlockWake::new(),
            capacity,
        }
    }

    pub fn push(&self, ev: SessionEvent) {
        let mut q = self.events.lock();
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(ev);
        drop(q);
        self.block.wake_all();
    }

    /// Pop the next event, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Result<SessionEvent> {
        if let Some(ev) = self.events.lock().pop_front() {
            return Ok(ev);
        }
        if self.block.is_stopped() {
            return Err(TransportError::TryAgain);
        }
        match self.block.wait(timeout) {
            WaitOutcome::Stopped => Err(TransportError::TryAgain),
            WaitOutcome::TimedOut => Err(TransportError::Timeout),
            WaitOutcome::Woken => self
                .events
                .lock()
                .pop_front()
                .ok_or(TransportError::Timeout),
        }
    }

    pub fn stop(&self) {
        self.block.stop();
    }

    pub fn reset(&self) {
        self.block.reset();
    }
}

/// Worker-facing outcome of one `poll()` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Session not started, or nothing to do.
    Idle,
    /// A frame's packets went to the NIC.
    Sent { epoch: u64, pkts: u32 },
    /// An epoch passed without a frame.
    Late { epoch: u64 },
    /// Nothing due before the given TAI time.
    Waiting { next_ns: u64 },
    /// Packets were ingested (RX).
    Received { pkts: usize },
}

/// Unified public session boundary, dispatched by exhaustive `match` so a
/// new media type extends the enum rather than a vtable.
pub enum MediaSession {
    Video20Tx(VideoTx),
    Video20Rx(VideoRx),
}

impl MediaSession {
    pub fn start(&self) -> Result<()> {
        match self {
            MediaSession::Video20Tx(s) => s.start(),
            MediaSession::Video20Rx(s) => s.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            MediaSession::Video20Tx(s) => s.stop(),
            MediaSession::Video20Rx(s) => s.stop(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            MediaSession::Video20Tx(s) => s.state(),
            MediaSession::Video20Rx(s) => s.state(),
        }
    }

    /// Drive one worker pass.
    pub fn poll(&self) -> PollStatus {
        match self {
            MediaSession::Video20Tx(s) => s.poll(),
            MediaSession::Video20Rx(s) => s.poll(),
        }
    }

    pub fn event_poll(&self, timeout: Duration) -> Result<SessionEvent> {
        match self {
            MediaSession::Video20Tx(s) => s.event_poll(timeout),
            MediaSession::Video20Rx(s) => s.event_poll(timeout),
        }
    }

    pub fn stats(&self) -> SessionStats {
        match self {
            MediaSession::Video20Tx(s) => s.stats(),
            MediaSession::Video20Rx(s) => s.stats(),
        }
    }

    pub fn reset_stats(&self) {
        match self {
            MediaSession::Video20Tx(s) => s.reset_stats(),
            MediaSession::Video20Rx(s) => s.reset_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Created);
        cell.transition(SessionState::Created, SessionState::Started)
            .unwrap();
        assert_eq!(cell.get(), SessionState::Started);
        let err = cell
            .transition(SessionState::Created, SessionState::Started)
            .unwrap_err();
        assert_eq!(err, SessionState::Started);
    }

    #[test]
    fn event_queue_delivers_in_order() {
        let q = EventQueue::new(4);
        q.push(SessionEvent::VSync { epoch: 1 });
        q.push(SessionEvent::VSync { epoch: 2 });
        assert_eq!(
            q.poll(Duration::ZERO).unwrap(),
            SessionEvent::VSync { epoch: 1 }
        );
        assert_eq!(
            q.poll(Duration::ZERO).unwrap(),
            SessionEvent::VSync { epoch: 2 }
        );
    }

    #[test]
    fn event_queue_overflow_drops_oldest() {
        let q = EventQueue::new(2);
        for e in 0..3 {
            q.push(SessionEvent::VSync { epoch: e });
        }
        assert_eq!(
            q.poll(Duration::ZERO).unwrap(),
            SessionEvent::VSync { epoch: 1 }
        );
    }

    #[test]
    fn event_poll_times_out_then_stops() {
        let q = EventQueue::new(2);
        match q.poll(Duration::from_millis(10)) {
            Err(TransportError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        q.stop();
        match q.poll(Duration::from_secs(1)) {
            Err(TransportError::TryAgain) => {}
            other => panic!("expected TryAgain, got {other:?}"),
        }
    }
}
