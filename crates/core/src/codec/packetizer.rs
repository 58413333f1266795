//! Frame → RTP packet serialization.
//!
//! The packetizer walks a frame's wire buffer in scan order and emits one
//! packet at a time into NIC-owned buffers. Packet boundaries follow the
//! session's [`PacketGeometry`]; a block- or general-packing packet that
//! crosses a scanline carries the continuation SRD for the head of the next
//! row (offset 0).

use crate::codec::packet::{self, RtpHeader, SampleRow, RFC4175_HDR_SIZE, SRD_SIZE};
use crate::codec::{PacketGeometry, PackingMode};
use crate::frame::Frame;

/// Description of one emitted packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketDesc {
    /// Total bytes written (headers + payload).
    pub len: usize,
    /// Index of this packet within the frame, 0-based.
    pub index: u32,
    /// Last packet of the frame/field.
    pub marker: bool,
    /// 32-bit sequence number carried by the packet.
    pub sequence: u32,
}

/// Stateful packetizer: owns the wire sequence counter for one session.
#[derive(Debug)]
pub struct Packetizer {
    geo: PacketGeometry,
    payload_type: u8,
    ssrc: u32,
    seq: u32,
}

impl Packetizer {
    pub fn new(geo: PacketGeometry, payload_type: u8, ssrc: u32) -> Self {
        Packetizer {
            geo,
            payload_type,
            ssrc,
            seq: 0,
        }
    }

    /// SSRC derived per RFC 3550 §8.1 when the caller does not supply one.
    pub fn random_ssrc() -> u32 {
        rand::random()
    }

    /// Next 32-bit sequence number to be emitted.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    pub fn geometry(&self) -> &PacketGeometry {
        &self.geo
    }

    /// Largest packet this session can emit, for sizing NIC buffers.
    pub fn max_packet_bytes(&self) -> usize {
        RFC4175_HDR_SIZE + SRD_SIZE + self.geo.payload_max
    }

    /// Begin serializing `frame` with the given 90 kHz timestamp.
    pub fn start_frame<'a>(&'a mut self, frame: &'a Frame, rtp_timestamp: u32) -> FrameCursor<'a> {
        FrameCursor {
            pk: self,
            frame,
            rtp_timestamp,
            pkt_idx: 0,
            row: 0,
            offset_pixels: 0,
        }
    }
}

/// Cursor over one frame's packets.
pub struct FrameCursor<'a> {
    pk: &'a mut Packetizer,
    frame: &'a Frame,
    rtp_timestamp: u32,
    pkt_idx: u32,
    row: u32,
    offset_pixels: u32,
}

impl FrameCursor<'_> {
    /// Packets not yet emitted.
    pub fn remaining(&self) -> u32 {
        self.pk.geo.total_pkts - self.pkt_idx
    }

    /// Serialize the next packet into `buf`.
    ///
    /// Returns `None` once the frame is fully emitted. `buf` must hold at
    /// least [`Packetizer::max_packet_bytes`].
    pub fn next_into(&mut self, buf: &mut [u8]) -> Option<PacketDesc> {
        let geo = self.pk.geo;
        if self.pkt_idx >= geo.total_pkts {
            return None;
        }
        let line_px = geo.width;
        let bytes_per_px_group = geo.pg_size as usize;
        let px_per_group = geo.pg_coverage;

        let line_remaining_px = line_px - self.offset_pixels;
        let line_remaining =
            (line_remaining_px / px_per_group) as usize * bytes_per_px_group;
        let frame_end = geo.frame_bytes();
        let pos = geo.byte_at(self.row, self.offset_pixels);
        let frame_remaining = frame_end - pos;

        let budget = geo.payload_max.min(frame_remaining);
        let (first_len, extra_len) = match geo.mode {
            PackingMode::SingleLine => (budget.min(line_remaining), 0),
            _ => {
                if budget <= line_remaining {
                    (budget, 0)
                } else {
                    // spans the scanline: cap the tail at one extra row
                    let tail = (budget - line_remaining).min(geo.line_bytes);
                    (line_remaining, tail)
                }
            }
        };

        let marker = self.pkt_idx + 1 == geo.total_pkts;
        let rtp = RtpHeader {
            marker,
            payload_type: self.pk.payload_type,
            sequence: self.pk.seq as u16,
            timestamp: self.rtp_timestamp,
            ssrc: self.pk.ssrc,
        };
        let seq_ext = (self.pk.seq >> 16) as u16;
        let srd = SampleRow {
            length: first_len as u16,
            row: self.row as u16,
            field: self.frame.second_field,
            offset: self.offset_pixels as u16,
            continuation: extra_len > 0,
        };
        let extra = (extra_len > 0).then(|| SampleRow {
            length: extra_len as u16,
            row: (self.row + 1) as u16,
            field: self.frame.second_field,
            offset: 0,
            continuation: false,
        });
        let hdr_len = packet::write_header(buf, &rtp, seq_ext, &srd, extra.as_ref());

        let payload_len = first_len + extra_len;
        let src = &self.frame.data.as_slice()[pos..pos + payload_len];
        buf[hdr_len..hdr_len + payload_len].copy_from_slice(src);

        let desc = PacketDesc {
            len: hdr_len + payload_len,
            index: self.pkt_idx,
            marker,
            sequence: self.pk.seq,
        };

        // advance the scan position
        let consumed_px = (payload_len / bytes_per_px_group) as u32 * px_per_group;
        let mut new_offset = self.offset_pixels + consumed_px;
        while new_offset >= line_px {
            new_offset -= line_px;
            self.row += 1;
        }
        self.offset_pixels = new_offset;
        self.pkt_idx += 1;
        self.pk.seq = self.pk.seq.wrapping_add(1);

        Some(desc)
    }
}
