//! Session counters and the stable tracepoint surface.
//!
//! Counters are plain fields mutated under the session mutex; a snapshot
//! clones the struct and `reset` zeroes it. Transient hot-path errors are
//! never logged individually — they land here and surface through the
//! periodic dump line.
//!
//! Tracepoints use the `tracing` crate at trace level under the
//! `st2110::trace` target. The event names are a stable contract
//! (`frame_available`, `frame_get`, `frame_put`, `frame_next`,
//! `frame_done`, `frame_drop`, `frame_dump`); probing frameworks key on
//! them.

use crate::frame::ring::RingOccupancy;
use crate::frame::MAX_PORTS;

/// Per-session counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames fully transmitted (TX) or delivered (RX).
    pub buffers_processed: u64,
    /// Pixel bytes moved by processed frames.
    pub bytes_processed: u64,
    /// Frames dropped: late epochs, stale receives, converter failures.
    pub buffers_dropped: u64,
    /// Free slots at snapshot time.
    pub buffers_free: u64,
    /// Slots loaned to the application at snapshot time.
    pub buffers_in_use: u64,
    /// TX epochs that passed without a frame on the wire.
    pub epochs_missed: u64,
    /// Packets received per port.
    pub pkts_received: [u64; MAX_PORTS],
    /// Packets whose payload was already covered by the other port.
    pub pkts_redundant: u64,
    /// Packets older than every tracked frame, dropped.
    pub pkts_out_of_order: u64,
    pub get_frame_try: u64,
    pub get_frame_succ: u64,
    pub put_frame: u64,
    pub convert_fail: u64,
    /// Ring transitions that violated the state diagram.
    pub bad_state: u64,
    /// Packets resent in answer to RTCP NACKs.
    pub pkts_retransmitted: u64,
}

impl SessionStats {
    /// Snapshot with the ring occupancy folded in.
    pub fn with_occupancy(mut self, occ: &RingOccupancy) -> Self {
        self.buffers_free = occ.free as u64;
        self.buffers_in_use = occ.in_user as u64;
        self
    }

    pub fn reset(&mut self) {
        *self = SessionStats::default();
    }
}

/// Emit the periodic session dump line.
pub fn dump(kind: &str, idx: u64, name: &str, occ: &RingOccupancy, stats: &SessionStats) {
    tracing::info!(
        "{kind}({idx},{name}), framebuffer queue: {}",
        occ.summary()
    );
    tracing::info!(
        "{kind}({idx}), frame get try {} succ {}, put {}, drop {}, epochs missed {}",
        stats.get_frame_try,
        stats.get_frame_succ,
        stats.put_frame,
        stats.buffers_dropped,
        stats.epochs_missed,
    );
    if stats.convert_fail > 0 {
        tracing::info!("{kind}({idx},{name}), convert fail {}", stats.convert_fail);
    }
}

/// Stable tracepoint surface.
///
/// Each point carries the session index, the slot index, and an address or
/// timestamp, mirroring a USDT probe signature.
pub mod trace {
    pub fn frame_available(session: u64, slot: usize, rtp_timestamp: u32) {
        tracing::trace!(target: "st2110::trace", session, slot, rtp_timestamp, "frame_available");
    }

    pub fn frame_get(session: u64, slot: usize, addr: usize) {
        tracing::trace!(target: "st2110::trace", session, slot, addr, "frame_get");
    }

    pub fn frame_put(session: u64, slot: usize, addr: usize, state: &'static str) {
        tracing::trace!(target: "st2110::trace", session, slot, addr, state, "frame_put");
    }

    /// Pacer dequeue.
    pub fn frame_next(session: u64, slot: usize, epoch: u64) {
        tracing::trace!(target: "st2110::trace", session, slot, epoch, "frame_next");
    }

    pub fn frame_done(session: u64, slot: usize, rtp_timestamp: u32) {
        tracing::trace!(target: "st2110::trace", session, slot, rtp_timestamp, "frame_done");
    }

    pub fn frame_drop(session: u64, slot: usize, rtp_timestamp: u32) {
        tracing::trace!(target: "st2110::trace", session, slot, rtp_timestamp, "frame_drop");
    }

    pub fn frame_dump(session: u64, slot: usize, addr: usize) {
        tracing::trace!(target: "st2110::trace", session, slot, addr, "frame_dump");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_everything() {
        let mut s = SessionStats {
            buffers_processed: 10,
            pkts_received: [5, 3],
            epochs_missed: 2,
            ..Default::default()
        };
        s.reset();
        assert_eq!(s, SessionStats::default());
    }

    #[test]
    fn occupancy_fold_in() {
        let occ = RingOccupancy {
            free: 3,
            in_user: 1,
            ..Default::default()
        };
        let s = SessionStats::default().with_occupancy(&occ);
        assert_eq!(s.buffers_free, 3);
        assert_eq!(s.buffers_in_use, 1);
    }
}
