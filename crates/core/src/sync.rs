//! Bounded-wait block/wake primitive shared by the blocking entry points.
//!
//! One [`BlockWake`] exists per session. Producers blocked in
//! `get_frame(timeout)` and pollers blocked in `event_poll(timeout)` park on
//! its condvar; frame completions wake them. `stop()` is restricted to one
//! relaxed atomic store plus one condvar broadcast so it stays safe to call
//! from a signal handler — no allocation, no mutex acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a producer-side notify.
    Woken,
    /// The timeout budget elapsed.
    TimedOut,
    /// The session was stopped; callers surface `TryAgain`.
    Stopped,
}

/// Mutex + condvar pair with a lock-free stop latch.
#[derive(Debug, Default)]
pub struct BlockWake {
    gate: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl BlockWake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the caller for up to `timeout`, or until woken or stopped.
    ///
    /// The stop latch is re-checked under the gate before parking, so a
    /// stop issued before the wait begins returns immediately.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut guard = self.gate.lock();
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                return WaitOutcome::Stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let res = self.cond.wait_until(&mut guard, deadline);
            if self.stopped.load(Ordering::Relaxed) {
                return WaitOutcome::Stopped;
            }
            if res.timed_out() {
                return WaitOutcome::TimedOut;
            }
            return WaitOutcome::Woken;
        }
    }

    /// Wake every parked waiter. Normal-path notify; takes the gate so a
    /// concurrent waiter cannot miss the signal between its predicate check
    /// and parking.
    pub fn wake_all(&self) {
        let _guard = self.gate.lock();
        self.cond.notify_all();
    }

    /// Latch the stop flag and broadcast.
    ///
    /// Async-signal-safe by construction: one relaxed store, one
    /// parking-lot broadcast. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.cond.notify_all();
    }

    /// Clear the latch (session restart).
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out() {
        let bw = BlockWake::new();
        let start = Instant::now();
        let out = bw.wait(Duration::from_millis(20));
        assert_eq!(out, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stop_before_wait_returns_immediately() {
        let bw = BlockWake::new();
        bw.stop();
        let start = Instant::now();
        assert_eq!(bw.wait(Duration::from_secs(5)), WaitOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn stop_releases_parked_waiter() {
        let bw = Arc::new(BlockWake::new());
        let bw2 = bw.clone();
        let handle = thread::spawn(move || bw2.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        bw.stop();
        let out = handle.join().unwrap();
        assert_eq!(out, WaitOutcome::Stopped);
    }

    #[test]
    fn wake_releases_parked_waiter() {
        let bw = Arc::new(BlockWake::new());
        let bw2 = bw.clone();
        let handle = thread::spawn(move || bw2.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        bw.wake_all();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Woken);
    }

    #[test]
    fn stop_is_idempotent() {
        let bw = BlockWake::new();
        bw.stop();
        bw.stop();
        bw.stop();
        assert!(bw.is_stopped());
        assert_eq!(bw.wait(Duration::from_secs(1)), WaitOutcome::Stopped);
    }
}
