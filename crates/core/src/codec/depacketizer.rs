//! RTP packet → frame reassembly.
//!
//! The depacketizer maintains a bounded set of in-flight frames keyed by
//! RTP timestamp. The first packet of a new timestamp asks the session for
//! a ring slot; subsequent packets write their SRD payloads into the slot's
//! wire buffer at `(row, offset)`. A frame completes when its distinct
//! payload coverage reaches the geometry's byte count; packets for a
//! timestamp older than the oldest tracked frame are counted out-of-order
//! and dropped, and payload already covered (the redundant path) is counted
//! as duplicate.

use std::collections::HashSet;

use crate::codec::packet::ParsedPacket;
use crate::codec::PacketGeometry;
use crate::error::{Result, TransportError};
use crate::frame::ring::WireJob;
use crate::frame::{Fps, FrameStatus, MAX_PORTS};

/// Classification of one received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPacketOutcome {
    /// Payload stored; `complete` is set when the frame's coverage is full.
    Stored { complete: bool, marker: bool },
    /// Payload region already covered (redundant-path duplicate).
    Duplicate,
    /// Timestamp predates every tracked frame; dropped as out-of-order.
    Stale,
    /// First packet of a new timestamp: the caller must allocate a slot
    /// via [`Depacketizer::track`] and re-ingest.
    NeedsSlot,
}

/// One in-flight frame under reassembly.
#[derive(Debug)]
pub struct Assembly {
    pub rtp_timestamp: u32,
    pub job: WireJob,
    /// Packets received per session port.
    pub pkts_recv: [u32; MAX_PORTS],
    pub marker_seen: bool,
    /// Second-field bit observed on this frame's SRDs.
    pub second_field: bool,
    seen_starts: HashSet<usize>,
    received_bytes: usize,
}

impl Assembly {
    fn new(rtp_timestamp: u32, job: WireJob) -> Self {
        Assembly {
            rtp_timestamp,
            job,
            pkts_recv: [0; MAX_PORTS],
            marker_seen: false,
            second_field: false,
            seen_starts: HashSet::new(),
            received_bytes: 0,
        }
    }

    pub fn complete(&self, geo: &PacketGeometry) -> bool {
        self.received_bytes >= geo.frame_bytes()
    }

    /// Distinct packets that contributed coverage.
    pub fn pkts_distinct(&self) -> u32 {
        self.seen_starts.len() as u32
    }

    /// Completion status for delivery: `Complete` when the primary port
    /// alone delivered the full frame, `Reconstructed` when the redundant
    /// port had to fill gaps, `Corrupted` when coverage is short.
    pub fn status(&self, geo: &PacketGeometry) -> FrameStatus {
        if !self.complete(geo) {
            FrameStatus::Corrupted
        } else if self.pkts_recv[0] >= geo.total_pkts {
            FrameStatus::Complete
        } else {
            FrameStatus::Reconstructed
        }
    }
}

fn ts_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Bounded reassembler for one RX session.
#[derive(Debug)]
pub struct Depacketizer {
    geo: PacketGeometry,
    max_in_flight: usize,
    inflight: Vec<Assembly>,
    /// Newest timestamp ever tracked; anything at or behind it that is no
    /// longer in flight is out-of-order.
    latest_ts: Option<u32>,
}

impl Depacketizer {
    pub fn new(geo: PacketGeometry, max_in_flight: usize) -> Self {
        Depacketizer {
            geo,
            max_in_flight: max_in_flight.max(1),
            inflight: Vec::new(),
            latest_ts: None,
        }
    }

    pub fn geometry(&self) -> &PacketGeometry {
        &self.geo
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    fn oldest_ts(&self) -> Option<u32> {
        self.inflight
            .iter()
            .map(|a| a.rtp_timestamp)
            .reduce(|a, b| if ts_newer(a, b) { b } else { a })
    }

    fn position(&self, ts: u32) -> Option<usize> {
        self.inflight.iter().position(|a| a.rtp_timestamp == ts)
    }

    /// Begin tracking a new timestamp with a freshly claimed slot.
    ///
    /// When the in-flight set is full, the oldest assembly is evicted and
    /// returned; the caller publishes or abandons it.
    pub fn track(&mut self, ts: u32, job: WireJob) -> Option<Assembly> {
        let evicted = if self.inflight.len() >= self.max_in_flight {
            let oldest = self.oldest_ts()?;
            let pos = self.position(oldest)?;
            Some(self.inflight.swap_remove(pos))
        } else {
            None
        };
        match self.latest_ts {
            Some(latest) if !ts_newer(ts, latest) => {}
            _ => self.latest_ts = Some(ts),
        }
        self.inflight.push(Assembly::new(ts, job));
        evicted
    }

    /// Whether the tracked frame for `ts` has full coverage.
    pub fn is_complete(&self, ts: u32) -> bool {
        self.position(ts)
            .is_some_and(|pos| self.inflight[pos].complete(&self.geo))
    }

    /// Take a complete assembly other than `current_ts`, oldest first.
    /// Used to flush frames whose marker packet was lost once a newer
    /// frame starts.
    pub fn take_flushable(&mut self, current_ts: u32) -> Option<Assembly> {
        let geo = self.geo;
        let mut candidate: Option<usize> = None;
        for (idx, asm) in self.inflight.iter().enumerate() {
            if asm.rtp_timestamp != current_ts && asm.complete(&geo) {
                match candidate {
                    None => candidate = Some(idx),
                    Some(c)
                        if ts_newer(
                            self.inflight[c].rtp_timestamp,
                            asm.rtp_timestamp,
                        ) =>
                    {
                        candidate = Some(idx)
                    }
                    _ => {}
                }
            }
        }
        candidate.map(|pos| self.inflight.swap_remove(pos))
    }

    /// Classify and store one parsed packet received on `port`.
    pub fn ingest(&mut self, port: usize, pkt: &ParsedPacket<'_>) -> Result<RxPacketOutcome> {
        let ts = pkt.rtp.timestamp;
        let Some(pos) = self.position(ts) else {
            if let Some(latest) = self.latest_ts {
                if !ts_newer(ts, latest) {
                    return Ok(RxPacketOutcome::Stale);
                }
            }
            return Ok(RxPacketOutcome::NeedsSlot);
        };

        let geo = self.geo;
        let asm = &mut self.inflight[pos];
        if port < MAX_PORTS {
            asm.pkts_recv[port] += 1;
        }
        if pkt.rtp.marker {
            asm.marker_seen = true;
        }
        if pkt.srd.field {
            asm.second_field = true;
        }

        let start = geo.byte_at(pkt.srd.row as u32, pkt.srd.offset as u32);
        if !asm.seen_starts.insert(start) {
            return Ok(RxPacketOutcome::Duplicate);
        }

        let mut src = pkt.payload;
        Self::write_srd(&geo, asm, start, &src[..pkt.srd.length as usize])?;
        src = &src[pkt.srd.length as usize..];
        if let Some(extra) = pkt.extra {
            let extra_start = geo.byte_at(extra.row as u32, extra.offset as u32);
            Self::write_srd(&geo, asm, extra_start, &src[..extra.length as usize])?;
        }

        Ok(RxPacketOutcome::Stored {
            complete: asm.complete(&geo),
            marker: pkt.rtp.marker,
        })
    }

    fn write_srd(
        geo: &PacketGeometry,
        asm: &mut Assembly,
        start: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let end = start + bytes.len();
        if end > geo.frame_bytes() {
            return Err(TransportError::InvalidArgument(format!(
                "srd extends to {} past frame of {}",
                end,
                geo.frame_bytes()
            )));
        }
        asm.job.frame.data.as_mut_slice()[start..end].copy_from_slice(bytes);
        asm.received_bytes += bytes.len();
        Ok(())
    }

    /// Take a tracked assembly out for publishing.
    pub fn finish(&mut self, ts: u32) -> Option<Assembly> {
        let pos = self.position(ts)?;
        Some(self.inflight.swap_remove(pos))
    }

    /// Drain every in-flight assembly (session stop).
    pub fn drain(&mut self) -> Vec<Assembly> {
        std::mem::take(&mut self.inflight)
    }
}

/// Geometry the format detector inferred from the first frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub interlaced: bool,
}

/// Watches the first frame of an auto-detect session.
///
/// Row-number and offset maxima give the geometry; the timestamp delta to
/// the following frame gives the rate. The detection frame itself is
/// discarded — delivery starts with the next frame.
#[derive(Debug, Default)]
pub struct FormatDetector {
    first_ts: Option<u32>,
    max_row: u32,
    max_px: u32,
    field_seen: bool,
    frame_done: bool,
}

impl FormatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns the detected format once the first frame
    /// boundary has passed and the rate is known.
    pub fn feed(
        &mut self,
        pkt: &ParsedPacket<'_>,
        pg_coverage: u32,
        pg_size: u32,
    ) -> Option<DetectedMeta> {
        let ts = pkt.rtp.timestamp;
        let first = *self.first_ts.get_or_insert(ts);
        if ts == first {
            for srd in std::iter::once(&pkt.srd).chain(pkt.extra.as_ref()) {
                self.max_row = self.max_row.max(srd.row as u32);
                let px = srd.offset as u32 + srd.length as u32 / pg_size * pg_coverage;
                self.max_px = self.max_px.max(px);
                self.field_seen |= srd.field;
            }
            if pkt.rtp.marker {
                self.frame_done = true;
            }
            return None;
        }
        if !self.frame_done {
            // first frame was joined mid-stream; restart on the new frame
            *self = Self::default();
            self.feed(pkt, pg_coverage, pg_size);
            return None;
        }
        let delta = ts.wrapping_sub(first);
        let fps = Fps::from_rtp_ticks(delta)?;
        let field_height = self.max_row + 1;
        Some(DetectedMeta {
            width: self.max_px,
            height: if self.field_seen {
                field_height * 2
            } else {
                field_height
            },
            fps,
            interlaced: self.field_seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packetizer::Packetizer;
    use crate::codec::{PacketGeometry, PackingMode};
    use crate::frame::ring::WireJob;
    use crate::frame::{Frame, PixelFormat};

    const FMT: PixelFormat = PixelFormat::Yuv422Rfc4175Be10;

    fn geo(w: u32, h: u32) -> PacketGeometry {
        PacketGeometry::new(PackingMode::BlockPacking, FMT, w, h, false).unwrap()
    }

    fn encode(g: PacketGeometry, ts: u32, seed: u8) -> (Frame, Vec<Vec<u8>>) {
        let mut frame = Frame::alloc(FMT, g.width, g.data_height, false).unwrap();
        for (i, b) in frame.data.as_mut_slice().iter_mut().enumerate() {
            *b = (i as u8).wrapping_add(seed);
        }
        let mut pk = Packetizer::new(g, 112, 42);
        let mut cursor = pk.start_frame(&frame, ts);
        let mut out = Vec::new();
        let mut buf = vec![0u8; RFC4175_MAX];
        while let Some(d) = cursor.next_into(&mut buf) {
            out.push(buf[..d.len].to_vec());
        }
        (frame, out)
    }

    const RFC4175_MAX: usize = 1500;

    fn job(g: &PacketGeometry) -> WireJob {
        WireJob {
            index: 0,
            seq: 0,
            frame: Frame::alloc(FMT, g.width, g.data_height, false).unwrap(),
            user_meta: Vec::new(),
        }
    }

    #[test]
    fn reassembles_byte_exact() {
        let g = geo(256, 16);
        let (src, pkts) = encode(g, 1000, 3);
        let mut d = Depacketizer::new(g, 3);

        let first = ParsedPacket::parse(&pkts[0]).unwrap();
        assert_eq!(d.ingest(0, &first).unwrap(), RxPacketOutcome::NeedsSlot);
        d.track(1000, job(&g));

        let mut complete = false;
        for p in &pkts {
            let parsed = ParsedPacket::parse(p).unwrap();
            if let RxPacketOutcome::Stored { complete: c, .. } = d.ingest(0, &parsed).unwrap() {
                complete = c;
            }
        }
        assert!(complete);
        let asm = d.finish(1000).unwrap();
        assert_eq!(asm.status(&g), FrameStatus::Complete);
        assert_eq!(asm.pkts_recv[0], g.total_pkts);
        assert_eq!(asm.job.frame.data.as_slice(), src.data.as_slice());
    }

    #[test]
    fn out_of_order_delivery_still_completes() {
        let g = geo(256, 16);
        let (src, mut pkts) = encode(g, 2000, 9);
        pkts.reverse();
        let mut d = Depacketizer::new(g, 3);
        d.track(2000, job(&g));
        for p in &pkts {
            let parsed = ParsedPacket::parse(p).unwrap();
            d.ingest(0, &parsed).unwrap();
        }
        let asm = d.finish(2000).unwrap();
        assert!(asm.complete(&g));
        assert_eq!(asm.job.frame.data.as_slice(), src.data.as_slice());
    }

    #[test]
    fn redundant_path_reconstruction() {
        let g = geo(256, 16);
        let (_, pkts) = encode(g, 3000, 1);
        let mut d = Depacketizer::new(g, 3);
        d.track(3000, job(&g));

        // primary loses every odd-indexed packet
        for (i, p) in pkts.iter().enumerate() {
            if i % 2 == 0 {
                d.ingest(0, &ParsedPacket::parse(p).unwrap()).unwrap();
            }
        }
        // redundant delivers everything; already-covered payload counts as duplicate
        let mut dups = 0;
        for p in &pkts {
            match d.ingest(1, &ParsedPacket::parse(p).unwrap()).unwrap() {
                RxPacketOutcome::Duplicate => dups += 1,
                _ => {}
            }
        }
        assert_eq!(dups, pkts.len().div_ceil(2));
        let asm = d.finish(3000).unwrap();
        assert_eq!(asm.status(&g), FrameStatus::Reconstructed);
        assert_eq!(asm.pkts_recv[0], g.total_pkts / 2 + g.total_pkts % 2);
        assert_eq!(asm.pkts_recv[1], g.total_pkts);
    }

    #[test]
    fn stale_timestamp_dropped() {
        let g = geo(64, 8);
        let (_, old_pkts) = encode(g, 100, 0);
        let mut d = Depacketizer::new(g, 3);
        d.track(2000, job(&g));
        let parsed = ParsedPacket::parse(&old_pkts[0]).unwrap();
        assert_eq!(d.ingest(0, &parsed).unwrap(), RxPacketOutcome::Stale);
    }

    #[test]
    fn full_tracker_evicts_oldest() {
        let g = geo(64, 8);
        let mut d = Depacketizer::new(g, 2);
        assert!(d.track(100, job(&g)).is_none());
        assert!(d.track(200, job(&g)).is_none());
        let evicted = d.track(300, job(&g)).unwrap();
        assert_eq!(evicted.rtp_timestamp, 100);
        assert_eq!(d.in_flight(), 2);
    }

    #[test]
    fn detector_reads_geometry_and_rate() {
        let g = geo(1920, 1080);
        let (_, f1) = encode(g, 90_000, 0);
        let (_, f2) = encode(g, 90_000 + 1500, 0);
        let mut det = FormatDetector::new();
        for p in &f1 {
            let parsed = ParsedPacket::parse(p).unwrap();
            assert!(det.feed(&parsed, g.pg_coverage, g.pg_size).is_none());
        }
        let parsed = ParsedPacket::parse(&f2[0]).unwrap();
        let meta = det.feed(&parsed, g.pg_coverage, g.pg_size).unwrap();
        assert_eq!(
            meta,
            DetectedMeta {
                width: 1920,
                height: 1080,
                fps: Fps::P60,
                interlaced: false,
            }
        );
    }

    #[test]
    fn detector_restarts_when_joining_mid_frame() {
        let g = geo(1920, 1080);
        let (_, f1) = encode(g, 1000, 0);
        let (_, f2) = encode(g, 2500, 0);
        let (_, f3) = encode(g, 4000, 0);
        let mut det = FormatDetector::new();
        // join mid-frame: leading half of frame 1, so its marker is missed
        for p in &f1[..f1.len() / 2] {
            let parsed = ParsedPacket::parse(p).unwrap();
            assert!(det.feed(&parsed, g.pg_coverage, g.pg_size).is_none());
        }
        // frame 2 arrives before a marker was seen: detector restarts on it
        for p in &f2 {
            let parsed = ParsedPacket::parse(p).unwrap();
            assert!(det.feed(&parsed, g.pg_coverage, g.pg_size).is_none());
        }
        let parsed = ParsedPacket::parse(&f3[0]).unwrap();
        let meta = det
            .feed(&parsed, g.pg_coverage, g.pg_size)
            .expect("detection completes after the first whole frame");
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.fps, Fps::P60);
    }
}
