//! Fixed-capacity ring of frame slots with explicit lifecycle states.
//!
//! The ring mediates between the application's frame-rate cadence and the
//! transport's packet-rate cadence. Each slot carries up to two frames — the
//! application-facing *surface* frame and the transport-facing *wire* frame —
//! plus a lifecycle state:
//!
//! ```text
//! TX: Free → InUser → Ready → InConverting → Converted → InTransmitting → Free
//! RX: Free → InTransmitting → Ready → InConverting → Converted → InUser → Free
//! ```
//!
//! In *derive mode* (surface format == wire format) the converting states are
//! skipped and a slot publishes directly as `Converted`.
//!
//! Ownership follows possession: a frame is moved out of its slot when the
//! application, the converter, or the NIC side takes it, and moved back on
//! the corresponding put. The ring mutex is held only across state
//! transitions, never across conversion or I/O. Any transition from a
//! non-matching state is a hard error; the slot is forced back to `Free` so
//! the ring cannot deadlock on a misbehaving caller.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, TransportError};
use crate::frame::{Frame, PixelFormat};
use crate::sync::{BlockWake, WaitOutcome};

/// Lifecycle state of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the ring, available to a producer.
    Free,
    /// Pixels written, awaiting conversion.
    Ready,
    /// Loaned to a converter.
    InConverting,
    /// Wire-format pixels ready for transmit (TX) or surface pixels ready
    /// for the application (RX).
    Converted,
    /// Loaned to the application.
    InUser,
    /// Loaned to the NIC side: transmit in flight (TX) or packet
    /// accumulation in progress (RX).
    InTransmitting,
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Ready => "ready",
            SlotState::InConverting => "in_converting",
            SlotState::Converted => "converted",
            SlotState::InUser => "in_user",
            SlotState::InTransmitting => "in_transmitting",
        }
    }

    /// Short code used in the periodic occupancy log line.
    pub fn short(&self) -> &'static str {
        match self {
            SlotState::Free => "F",
            SlotState::Ready => "R",
            SlotState::InConverting => "IC",
            SlotState::Converted => "C",
            SlotState::InUser => "U",
            SlotState::InTransmitting => "T",
        }
    }
}

/// Per-state slot counts; always sums to the ring capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingOccupancy {
    pub free: usize,
    pub ready: usize,
    pub in_converting: usize,
    pub converted: usize,
    pub in_user: usize,
    pub in_transmitting: usize,
}

impl RingOccupancy {
    pub fn total(&self) -> usize {
        self.free + self.ready + self.in_converting + self.converted + self.in_user
            + self.in_transmitting
    }

    /// Compact `F:2 C:1 U:1` rendering for the periodic stat line.
    pub fn summary(&self) -> String {
        let counts = [
            (SlotState::Free, self.free),
            (SlotState::Ready, self.ready),
            (SlotState::InConverting, self.in_converting),
            (SlotState::Converted, self.converted),
            (SlotState::InUser, self.in_user),
            (SlotState::InTransmitting, self.in_transmitting),
        ];
        let mut out = String::new();
        for (state, n) in counts {
            if n > 0 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(state.short());
                out.push(':');
                out.push_str(&n.to_string());
            }
        }
        out
    }
}

struct Slot {
    state: SlotState,
    /// Monotonic sequence assigned when a producer claims the slot; the
    /// transmit side prefers the highest value so a producer outrunning the
    /// line rate ships the most recent frame.
    seq: u32,
    frame_done_fired: bool,
    /// Application-side frame; `None` in derive mode or while loaned.
    surface: Option<Frame>,
    /// Transport-side frame; `None` while loaned.
    wire: Option<Frame>,
    user_meta: Vec<u8>,
    user_meta_len: usize,
    /// Optional application-managed content digest.
    digest: Option<[u8; 32]>,
}

struct RingInner {
    slots: Vec<Slot>,
    next_seq: u32,
}

/// Configuration for building a [`FrameRing`].
#[derive(Debug, Clone)]
pub struct RingConfig {
    pub capacity: usize,
    pub surface_fmt: PixelFormat,
    pub wire_fmt: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    /// Surface format equals wire format; converting states are skipped.
    pub derive: bool,
    /// Buffers are caller-provided (`put_ext_frame`); slots start unbacked.
    pub external: bool,
    /// `get` operations may park on the ring condvar.
    pub blocking_get: bool,
    /// Capacity reserved per slot for user metadata.
    pub user_meta_capacity: usize,
}

/// Ring capacity bounds; 3–8 is the typical operating range.
pub const RING_CAPACITY_MIN: usize = 1;
pub const RING_CAPACITY_MAX: usize = 64;

/// A slot loaned to the application by `get`.
#[derive(Debug)]
pub struct UserSlot {
    pub index: usize,
    pub seq: u32,
    pub frame: Frame,
    /// Metadata received with the frame (RX side only).
    pub user_meta: Vec<u8>,
}

/// A slot loaned to a converter: both sides of the conversion.
#[derive(Debug)]
pub struct ConvertJob {
    pub index: usize,
    pub surface: Frame,
    pub wire: Frame,
}

/// A slot loaned to the transmit path (TX) or claimed for packet
/// accumulation (RX).
#[derive(Debug)]
pub struct WireJob {
    pub index: usize,
    pub seq: u32,
    pub frame: Frame,
    pub user_meta: Vec<u8>,
}

/// Fixed ring of frame slots guarded by a single mutex.
pub struct FrameRing {
    inner: Mutex<RingInner>,
    cfg: RingConfig,
    block: BlockWake,
}

impl FrameRing {
    pub fn new(cfg: RingConfig) -> Result<Self> {
        if !(RING_CAPACITY_MIN..=RING_CAPACITY_MAX).contains(&cfg.capacity) {
            return Err(TransportError::InvalidArgument(format!(
                "ring capacity {} outside {}..={}",
                cfg.capacity, RING_CAPACITY_MIN, RING_CAPACITY_MAX
            )));
        }
        let mut slots = Vec::with_capacity(cfg.capacity);
        for _ in 0..cfg.capacity {
            let wire = if cfg.external && cfg.derive {
                Frame::unbacked(cfg.wire_fmt, cfg.width, cfg.height, cfg.interlaced)
            } else {
                Frame::alloc(cfg.wire_fmt, cfg.width, cfg.height, cfg.interlaced)?
            };
            let surface = if cfg.derive {
                None
            } else if cfg.external {
                Some(Frame::unbacked(
                    cfg.surface_fmt,
                    cfg.width,
                    cfg.height,
                    cfg.interlaced,
                ))
            } else {
                Some(Frame::alloc(
                    cfg.surface_fmt,
                    cfg.width,
                    cfg.height,
                    cfg.interlaced,
                )?)
            };
            slots.push(Slot {
                state: SlotState::Free,
                seq: 0,
                frame_done_fired: false,
                surface,
                wire: Some(wire),
                user_meta: vec![0u8; cfg.user_meta_capacity],
                user_meta_len: 0,
                digest: None,
            });
        }
        Ok(FrameRing {
            inner: Mutex::new(RingInner { slots, next_seq: 0 }),
            cfg,
            block: BlockWake::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    pub fn derive(&self) -> bool {
        self.cfg.derive
    }

    /// The block/wake primitive, exposed for session-level event polling.
    pub fn block(&self) -> &BlockWake {
        &self.block
    }

    /// Latch the stop flag and release every parked waiter.
    pub fn stop(&self) {
        self.block.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.block.is_stopped()
    }

    /// Per-state slot counts, taken under the ring mutex.
    pub fn occupancy(&self) -> RingOccupancy {
        let inner = self.inner.lock();
        let mut occ = RingOccupancy::default();
        for slot in &inner.slots {
            match slot.state {
                SlotState::Free => occ.free += 1,
                SlotState::Ready => occ.ready += 1,
                SlotState::InConverting => occ.in_converting += 1,
                SlotState::Converted => occ.converted += 1,
                SlotState::InUser => occ.in_user += 1,
                SlotState::InTransmitting => occ.in_transmitting += 1,
            }
        }
        occ
    }

    fn modular_newer(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) > 0
    }

    fn find(inner: &RingInner, state: SlotState) -> Option<usize> {
        inner.slots.iter().position(|s| s.state == state)
    }

    fn find_newest(inner: &RingInner, state: SlotState) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, slot) in inner.slots.iter().enumerate() {
            if slot.state == state {
                match best {
                    None => best = Some(idx),
                    Some(b) if Self::modular_newer(slot.seq, inner.slots[b].seq) => {
                        best = Some(idx)
                    }
                    _ => {}
                }
            }
        }
        best
    }

    fn find_oldest(inner: &RingInner, state: SlotState) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, slot) in inner.slots.iter().enumerate() {
            if slot.state == state {
                match best {
                    None => best = Some(idx),
                    Some(b) if Self::modular_newer(inner.slots[b].seq, slot.seq) => {
                        best = Some(idx)
                    }
                    _ => {}
                }
            }
        }
        best
    }

    /// The application-side frame of a slot: the wire frame in derive mode,
    /// the surface frame otherwise.
    fn take_user_frame(slot: &mut Slot, derive: bool) -> Option<Frame> {
        if derive {
            slot.wire.take()
        } else {
            slot.surface.take()
        }
    }

    fn restore_user_frame(slot: &mut Slot, derive: bool, frame: Frame) {
        if derive {
            slot.wire = Some(frame);
        } else {
            slot.surface = Some(frame);
        }
    }

    /// Claim a `Free` slot for the producer: `Free → InUser`.
    ///
    /// Blocks on the ring condvar for up to `timeout` when the ring was
    /// configured with blocking gets and no slot is free. Returns
    /// [`TransportError::TryAgain`] immediately once the ring is stopped.
    pub fn get_free(&self, timeout: Duration) -> Result<UserSlot> {
        if self.block.is_stopped() {
            return Err(TransportError::TryAgain);
        }
        let mut inner = self.inner.lock();
        let mut idx = Self::find(&inner, SlotState::Free);
        if idx.is_none() && self.cfg.blocking_get {
            drop(inner);
            match self.block.wait(timeout) {
                WaitOutcome::Stopped => return Err(TransportError::TryAgain),
                WaitOutcome::TimedOut => return Err(TransportError::Timeout),
                WaitOutcome::Woken => {}
            }
            inner = self.inner.lock();
            idx = Self::find(&inner, SlotState::Free);
        }
        let Some(idx) = idx else {
            return Err(if self.cfg.blocking_get {
                TransportError::Timeout
            } else {
                TransportError::Busy
            });
        };
        let seq = inner.next_seq;
        inner.next_seq = inner.next_seq.wrapping_add(1);
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::InUser;
        slot.seq = seq;
        slot.frame_done_fired = false;
        slot.user_meta_len = 0;
        slot.digest = None;
        let frame = Self::take_user_frame(slot, self.cfg.derive)
            .ok_or(TransportError::Fatal(format!("slot {idx} frame missing")))?;
        Ok(UserSlot {
            index: idx,
            seq,
            frame,
            user_meta: Vec::new(),
        })
    }

    /// Return the producer's frame: `InUser → Ready` (conversion pending).
    pub fn put_ready(&self, index: usize, frame: Frame, meta: Option<&[u8]>) -> Result<()> {
        self.put_user(index, frame, meta, SlotState::Ready)
    }

    /// Return the producer's frame already in wire form:
    /// `InUser → Converted` (derive mode or inline conversion).
    pub fn put_converted(&self, index: usize, frame: Frame, meta: Option<&[u8]>) -> Result<()> {
        self.put_user(index, frame, meta, SlotState::Converted)
    }

    fn put_user(
        &self,
        index: usize,
        frame: Frame,
        meta: Option<&[u8]>,
        next: SlotState,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        if slot.state != SlotState::InUser {
            let actual = slot.state.name();
            Self::restore_user_frame(slot, self.cfg.derive, frame);
            slot.state = SlotState::Free;
            return Err(TransportError::BadState {
                slot: index,
                expected: SlotState::InUser.name(),
                actual,
            });
        }
        if let Some(meta) = meta {
            if meta.len() > slot.user_meta.len() {
                let actual = slot.state.name();
                Self::restore_user_frame(slot, self.cfg.derive, frame);
                slot.state = SlotState::Free;
                tracing::warn!(slot = index, size = meta.len(), "user meta too large");
                return Err(TransportError::BadState {
                    slot: index,
                    expected: SlotState::InUser.name(),
                    actual,
                });
            }
            slot.user_meta[..meta.len()].copy_from_slice(meta);
            slot.user_meta_len = meta.len();
        }
        Self::restore_user_frame(slot, self.cfg.derive, frame);
        slot.state = next;
        tracing::trace!(slot = index, state = next.name(), "producer put");
        Ok(())
    }

    /// Install both frames after an inline conversion:
    /// `InUser → Converted` with surface and wire restored together.
    pub fn put_converted_pair(
        &self,
        index: usize,
        surface: Frame,
        wire: Frame,
        meta: Option<&[u8]>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        if slot.state != SlotState::InUser {
            let actual = slot.state.name();
            slot.surface = Some(surface);
            slot.wire = Some(wire);
            slot.state = SlotState::Free;
            return Err(TransportError::BadState {
                slot: index,
                expected: SlotState::InUser.name(),
                actual,
            });
        }
        if let Some(meta) = meta {
            let n = meta.len().min(slot.user_meta.len());
            slot.user_meta[..n].copy_from_slice(&meta[..n]);
            slot.user_meta_len = n;
        }
        slot.surface = Some(surface);
        slot.wire = Some(wire);
        slot.state = SlotState::Converted;
        Ok(())
    }

    /// Inline conversion failed: restore both frames, `InUser → Free`.
    pub fn put_failed(&self, index: usize, surface: Frame, wire: Frame) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.surface = Some(surface);
        slot.wire = Some(wire);
        slot.state = SlotState::Free;
    }

    /// Whether any slot sits `Converted`, without claiming it.
    pub fn has_converted(&self) -> bool {
        let inner = self.inner.lock();
        inner.slots.iter().any(|s| s.state == SlotState::Converted)
    }

    /// Take the external backing buffer out of a slot's wire frame,
    /// leaving the slot unbacked for the next `put_ext_frame`.
    pub fn take_external(&self, index: usize) -> Option<(Vec<u8>, u64)> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        let frame = slot.wire.as_mut()?;
        if !frame.data.is_external() {
            return None;
        }
        let data = std::mem::replace(&mut frame.data, crate::frame::FrameData::Unset);
        frame.buffer_size = 0;
        frame.data_size = 0;
        match data {
            crate::frame::FrameData::External { buf, iova } => Some((buf, iova)),
            _ => None,
        }
    }

    /// Loan the wire frame of an `InUser` slot for inline conversion.
    pub fn take_wire(&self, index: usize) -> Result<Frame> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        if slot.state != SlotState::InUser {
            return Err(TransportError::BadState {
                slot: index,
                expected: SlotState::InUser.name(),
                actual: slot.state.name(),
            });
        }
        slot.wire
            .take()
            .ok_or(TransportError::Fatal(format!("slot {index} wire missing")))
    }

    /// Claim the oldest `Ready` slot for a converter:
    /// `Ready → InConverting`, both frames loaned.
    pub fn begin_convert(&self) -> Option<ConvertJob> {
        let mut inner = self.inner.lock();
        let idx = Self::find_oldest(&inner, SlotState::Ready)?;
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::InConverting;
        let surface = slot.surface.take()?;
        let wire = slot.wire.take()?;
        Some(ConvertJob {
            index: idx,
            surface,
            wire,
        })
    }

    /// Finish a conversion: `InConverting → Converted` on success,
    /// `InConverting → Free` on failure (producer re-woken by the caller).
    pub fn finish_convert(
        &self,
        index: usize,
        surface: Frame,
        wire: Frame,
        ok: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        let expected = SlotState::InConverting;
        let actual = slot.state;
        slot.surface = Some(surface);
        slot.wire = Some(wire);
        if actual != expected {
            slot.state = SlotState::Free;
            return Err(TransportError::BadState {
                slot: index,
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        slot.state = if ok {
            SlotState::Converted
        } else {
            SlotState::Free
        };
        Ok(())
    }

    /// Claim the newest `Converted` slot for transmit:
    /// `Converted → InTransmitting`, wire frame loaned.
    ///
    /// Newest-first so a producer running ahead of the line rate ships the
    /// most recent frame; older converted frames age out via
    /// [`drop_late`](Self::drop_late).
    pub fn begin_transmit_newest(&self) -> Option<WireJob> {
        let mut inner = self.inner.lock();
        let idx = Self::find_newest(&inner, SlotState::Converted)?;
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::InTransmitting;
        let frame = slot.wire.take()?;
        let meta = slot.user_meta[..slot.user_meta_len].to_vec();
        Some(WireJob {
            index: idx,
            seq: slot.seq,
            frame,
            user_meta: meta,
        })
    }

    /// Transmit finished: `InTransmitting → Free`; wakes blocked producers.
    pub fn complete(&self, index: usize, frame: Frame) -> Result<()> {
        let res = {
            let mut inner = self.inner.lock();
            let slot = &mut inner.slots[index];
            let actual = slot.state;
            slot.wire = Some(frame);
            slot.state = SlotState::Free;
            if actual == SlotState::InTransmitting {
                Ok(())
            } else {
                Err(TransportError::BadState {
                    slot: index,
                    expected: SlotState::InTransmitting.name(),
                    actual: actual.name(),
                })
            }
        };
        self.block.wake_all();
        res
    }

    /// Drop the oldest `Converted` slot when its epoch has passed:
    /// `Converted → Free`; wakes blocked producers.
    ///
    /// Returns the slot index and its wire RTP timestamp.
    pub fn drop_late(&self) -> Option<(usize, u32)> {
        let dropped = {
            let mut inner = self.inner.lock();
            let idx = Self::find_oldest(&inner, SlotState::Converted)?;
            let slot = &mut inner.slots[idx];
            slot.state = SlotState::Free;
            let rtp = slot.wire.as_ref().map(|f| f.rtp_timestamp).unwrap_or(0);
            Some((idx, rtp))
        };
        self.block.wake_all();
        dropped
    }

    /// Claim a `Free` slot for packet accumulation (RX):
    /// `Free → InTransmitting`, wire frame loaned.
    pub fn begin_receive(&self) -> Option<WireJob> {
        let mut inner = self.inner.lock();
        let idx = Self::find(&inner, SlotState::Free)?;
        let seq = inner.next_seq;
        inner.next_seq = inner.next_seq.wrapping_add(1);
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::InTransmitting;
        slot.seq = seq;
        slot.user_meta_len = 0;
        let frame = slot.wire.take()?;
        Some(WireJob {
            index: idx,
            seq,
            frame,
            user_meta: Vec::new(),
        })
    }

    /// A received frame is complete: `InTransmitting → Ready`.
    pub fn publish_received(&self, index: usize, frame: Frame, meta: Option<&[u8]>) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        let actual = slot.state;
        slot.wire = Some(frame);
        if actual != SlotState::InTransmitting {
            slot.state = SlotState::Free;
            return Err(TransportError::BadState {
                slot: index,
                expected: SlotState::InTransmitting.name(),
                actual: actual.name(),
            });
        }
        if let Some(meta) = meta {
            let n = meta.len().min(slot.user_meta.len());
            slot.user_meta[..n].copy_from_slice(&meta[..n]);
            slot.user_meta_len = n;
        }
        slot.state = SlotState::Ready;
        Ok(())
    }

    /// Abandon an in-progress receive: `InTransmitting → Free`.
    pub fn abandon_receive(&self, index: usize, frame: Frame) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.wire = Some(frame);
        slot.state = SlotState::Free;
    }

    /// Promote a received `Ready` slot straight to `Converted`
    /// (derive mode — no conversion required). Wakes the consumer.
    pub fn promote_ready_derive(&self, index: usize) -> Result<()> {
        let res = {
            let mut inner = self.inner.lock();
            let slot = &mut inner.slots[index];
            if slot.state != SlotState::Ready {
                let actual = slot.state.name();
                slot.state = SlotState::Free;
                return Err(TransportError::BadState {
                    slot: index,
                    expected: SlotState::Ready.name(),
                    actual,
                });
            }
            slot.state = SlotState::Converted;
            Ok(())
        };
        self.block.wake_all();
        res
    }

    /// Consumer get (RX): oldest `Converted → InUser`, user frame and
    /// metadata loaned. Blocking semantics mirror
    /// [`get_free`](Self::get_free).
    pub fn get_converted(&self, timeout: Duration) -> Result<UserSlot> {
        if self.block.is_stopped() {
            return Err(TransportError::TryAgain);
        }
        let mut inner = self.inner.lock();
        let mut idx = Self::find_oldest(&inner, SlotState::Converted);
        if idx.is_none() && self.cfg.blocking_get {
            drop(inner);
            match self.block.wait(timeout) {
                WaitOutcome::Stopped => return Err(TransportError::TryAgain),
                WaitOutcome::TimedOut => return Err(TransportError::Timeout),
                WaitOutcome::Woken => {}
            }
            inner = self.inner.lock();
            idx = Self::find_oldest(&inner, SlotState::Converted);
        }
        let Some(idx) = idx else {
            return Err(if self.cfg.blocking_get {
                TransportError::Timeout
            } else {
                TransportError::Busy
            });
        };
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::InUser;
        let frame = Self::take_user_frame(slot, self.cfg.derive)
            .ok_or(TransportError::Fatal(format!("slot {idx} frame missing")))?;
        let meta = slot.user_meta[..slot.user_meta_len].to_vec();
        Ok(UserSlot {
            index: idx,
            seq: slot.seq,
            frame,
            user_meta: meta,
        })
    }

    /// Consumer put (RX): `InUser → Free`.
    pub fn put_free(&self, index: usize, frame: Frame) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        let actual = slot.state;
        Self::restore_user_frame(slot, self.cfg.derive, frame);
        slot.state = SlotState::Free;
        if actual == SlotState::InUser {
            Ok(())
        } else {
            Err(TransportError::BadState {
                slot: index,
                expected: SlotState::InUser.name(),
                actual: actual.name(),
            })
        }
    }

    /// Record whether the frame-done notification fired for this slot.
    /// Returns the previous value.
    pub fn mark_done_fired(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        std::mem::replace(&mut slot.frame_done_fired, true)
    }

    /// Set or clear the application-managed content digest of a slot.
    pub fn set_digest(&self, index: usize, digest: Option<[u8; 32]>) {
        self.inner.lock().slots[index].digest = digest;
    }

    pub fn digest(&self, index: usize) -> Option<[u8; 32]> {
        self.inner.lock().slots[index].digest
    }

    /// Slots not yet back in `Free`, reported at destroy time.
    pub fn stragglers(&self) -> Vec<(usize, &'static str)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SlotState::Free)
            .map(|(i, s)| (i, s.state.name()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn ring(capacity: usize, derive: bool, blocking: bool) -> FrameRing {
        FrameRing::new(RingConfig {
            capacity,
            surface_fmt: PixelFormat::Yuv422Planar10Le,
            wire_fmt: PixelFormat::Yuv422Rfc4175Be10,
            width: 32,
            height: 8,
            interlaced: false,
            derive,
            external: false,
            blocking_get: blocking,
            user_meta_capacity: 64,
        })
        .unwrap()
    }

    fn assert_conserved(r: &FrameRing) {
        assert_eq!(r.occupancy().total(), r.capacity());
    }

    #[test]
    fn capacity_bounds_enforced() {
        let mut cfg = RingConfig {
            capacity: 0,
            surface_fmt: PixelFormat::Yuv422Planar10Le,
            wire_fmt: PixelFormat::Yuv422Rfc4175Be10,
            width: 32,
            height: 8,
            interlaced: false,
            derive: false,
            external: false,
            blocking_get: false,
            user_meta_capacity: 0,
        };
        assert!(FrameRing::new(cfg.clone()).is_err());
        cfg.capacity = 65;
        assert!(FrameRing::new(cfg.clone()).is_err());
        cfg.capacity = 64;
        assert!(FrameRing::new(cfg).is_ok());
    }

    #[test]
    fn tx_full_lifecycle_convert_mode() {
        let r = ring(3, false, false);
        assert_conserved(&r);

        let user = r.get_free(Duration::ZERO).unwrap();
        assert_eq!(r.occupancy().in_user, 1);
        r.put_ready(user.index, user.frame, None).unwrap();
        assert_eq!(r.occupancy().ready, 1);

        let job = r.begin_convert().unwrap();
        assert_eq!(r.occupancy().in_converting, 1);
        r.finish_convert(job.index, job.surface, job.wire, true)
            .unwrap();
        assert_eq!(r.occupancy().converted, 1);

        let tx = r.begin_transmit_newest().unwrap();
        assert_eq!(r.occupancy().in_transmitting, 1);
        r.complete(tx.index, tx.frame).unwrap();
        assert_eq!(r.occupancy().free, 3);
        assert_conserved(&r);
    }

    #[test]
    fn derive_mode_put_goes_straight_to_converted() {
        let r = ring(2, true, false);
        let user = r.get_free(Duration::ZERO).unwrap();
        r.put_converted(user.index, user.frame, None).unwrap();
        assert_eq!(r.occupancy().converted, 1);
        assert!(r.begin_convert().is_none());
    }

    #[test]
    fn newest_converted_wins() {
        let r = ring(3, true, false);
        for _ in 0..3 {
            let u = r.get_free(Duration::ZERO).unwrap();
            r.put_converted(u.index, u.frame, None).unwrap();
        }
        let tx = r.begin_transmit_newest().unwrap();
        assert_eq!(tx.seq, 2, "newest seq preferred");
    }

    #[test]
    fn drop_late_takes_oldest() {
        let r = ring(3, true, false);
        for _ in 0..2 {
            let u = r.get_free(Duration::ZERO).unwrap();
            r.put_converted(u.index, u.frame, None).unwrap();
        }
        let occ = r.occupancy();
        assert_eq!(occ.converted, 2);
        let (idx, _) = r.drop_late().unwrap();
        // slot with seq 0 was claimed first → index 0
        assert_eq!(idx, 0);
        assert_eq!(r.occupancy().converted, 1);
        let tx = r.begin_transmit_newest().unwrap();
        assert_eq!(tx.seq, 1);
    }

    #[test]
    fn nonblocking_exhaustion_is_busy() {
        let r = ring(1, true, false);
        let u = r.get_free(Duration::ZERO).unwrap();
        match r.get_free(Duration::ZERO) {
            Err(TransportError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        r.put_converted(u.index, u.frame, None).unwrap();
    }

    #[test]
    fn blocking_get_times_out() {
        let r = ring(1, true, true);
        let _held = r.get_free(Duration::from_millis(5)).unwrap();
        let start = Instant::now();
        match r.get_free(Duration::from_millis(30)) {
            Err(TransportError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocking_get_woken_by_complete() {
        let r = Arc::new(ring(1, true, true));
        let u = r.get_free(Duration::ZERO).unwrap();
        r.put_converted(u.index, u.frame, None).unwrap();
        let tx = r.begin_transmit_newest().unwrap();

        let r2 = r.clone();
        let waiter = thread::spawn(move || r2.get_free(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        r.complete(tx.index, tx.frame).unwrap();
        let got = waiter.join().unwrap();
        assert!(got.is_ok(), "waiter should observe the freed slot");
    }

    #[test]
    fn stop_unblocks_with_try_again() {
        let r = Arc::new(ring(1, true, true));
        let _held = r.get_free(Duration::ZERO).unwrap();
        let r2 = r.clone();
        let waiter = thread::spawn(move || r2.get_free(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        r.stop();
        match waiter.join().unwrap() {
            Err(TransportError::TryAgain) => {}
            other => panic!("expected TryAgain, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn bad_state_put_recycles_to_free() {
        let r = ring(2, true, false);
        let u = r.get_free(Duration::ZERO).unwrap();
        let idx = u.index;
        r.put_converted(idx, u.frame, None).unwrap();
        // second put on the same slot violates the state machine
        let stray = Frame::alloc(PixelFormat::Yuv422Rfc4175Be10, 32, 8, false).unwrap();
        match r.put_converted(idx, stray, None) {
            Err(TransportError::BadState { slot, .. }) => assert_eq!(slot, idx),
            other => panic!("expected BadState, got {other:?}"),
        }
        // forced back to Free, ring still consistent
        assert_eq!(r.occupancy().free, 2);
        assert_conserved(&r);
    }

    #[test]
    fn rx_receive_lifecycle() {
        let r = ring(2, false, false);
        let job = r.begin_receive().unwrap();
        assert_eq!(r.occupancy().in_transmitting, 1);
        r.publish_received(job.index, job.frame, Some(b"meta")).unwrap();
        assert_eq!(r.occupancy().ready, 1);

        let c = r.begin_convert().unwrap();
        r.finish_convert(c.index, c.surface, c.wire, true).unwrap();

        let user = r.get_converted(Duration::ZERO).unwrap();
        assert_eq!(user.user_meta, b"meta");
        r.put_free(user.index, user.frame).unwrap();
        assert_eq!(r.occupancy().free, 2);
    }

    #[test]
    fn occupancy_summary_format() {
        let r = ring(3, true, false);
        let _u = r.get_free(Duration::ZERO).unwrap();
        let occ = r.occupancy();
        assert_eq!(occ.summary(), "F:2 U:1");
    }

    #[test]
    fn user_meta_oversize_rejected() {
        let r = ring(2, true, false);
        let u = r.get_free(Duration::ZERO).unwrap();
        let meta = vec![0u8; 65];
        assert!(r.put_converted(u.index, u.frame, Some(&meta)).is_err());
        assert_eq!(r.occupancy().free, 2);
    }
}
