//! Optional RTCP NACK retransmission (RFC 4585).
//!
//! When a session enables RTCP, the transmit side retains the packets of
//! the last K frames. On receipt of a Generic NACK feedback message
//! (PT=205, FMT=1) the referenced packets are resent on their original
//! port. Lost sequences are encoded as FCI entries of a packet id plus a
//! 16-bit bitmask of the following sequences (RFC 4585 §6.2.1).

use std::collections::VecDeque;

use crate::error::{Result, TransportError};

/// RTCP transport-layer feedback payload type (RFC 4585 §6.1).
pub const RTCP_PT_RTPFB: u8 = 205;

/// Feedback message type for Generic NACK.
pub const RTPFB_FMT_NACK: u8 = 1;

/// A parsed Generic NACK message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPacket {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// `(pid, blp)` pairs per RFC 4585 §6.2.1.
    pub entries: Vec<(u16, u16)>,
}

impl NackPacket {
    /// Expand the FCI entries into the individual lost sequence numbers.
    pub fn lost_sequences(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for &(pid, blp) in &self.entries {
            out.push(pid);
            for bit in 0..16 {
                if blp & (1 << bit) != 0 {
                    out.push(pid.wrapping_add(bit + 1));
                }
            }
        }
        out
    }

    /// Serialize to an on-wire RTCP compound element.
    pub fn write(&self) -> Vec<u8> {
        // length field counts 32-bit words minus one
        let words = 2 + self.entries.len() as u16;
        let mut buf = Vec::with_capacity(4 + words as usize * 4);
        buf.push((2 << 6) | RTPFB_FMT_NACK);
        buf.push(RTCP_PT_RTPFB);
        buf.extend_from_slice(&words.to_be_bytes());
        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        buf.extend_from_slice(&self.media_ssrc.to_be_bytes());
        for &(pid, blp) in &self.entries {
            buf.extend_from_slice(&pid.to_be_bytes());
            buf.extend_from_slice(&blp.to_be_bytes());
        }
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(TransportError::InvalidArgument(format!(
                "rtcp message truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0] >> 6 != 2 {
            return Err(TransportError::InvalidArgument("rtcp version".into()));
        }
        if buf[1] != RTCP_PT_RTPFB || buf[0] & 0x1f != RTPFB_FMT_NACK {
            return Err(TransportError::InvalidArgument(format!(
                "not a generic nack: pt {} fmt {}",
                buf[1],
                buf[0] & 0x1f
            )));
        }
        let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let fci_count = words.saturating_sub(2);
        if buf.len() < 12 + fci_count * 4 {
            return Err(TransportError::InvalidArgument("nack fci truncated".into()));
        }
        let mut entries = Vec::with_capacity(fci_count);
        for i in 0..fci_count {
            let off = 12 + i * 4;
            entries.push((
                u16::from_be_bytes([buf[off], buf[off + 1]]),
                u16::from_be_bytes([buf[off + 2], buf[off + 3]]),
            ));
        }
        Ok(NackPacket {
            sender_ssrc: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            media_ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            entries,
        })
    }

    /// Build the FCI entries covering a sorted list of lost sequences.
    pub fn from_lost(sender_ssrc: u32, media_ssrc: u32, lost: &[u16]) -> Self {
        let mut entries: Vec<(u16, u16)> = Vec::new();
        for &seq in lost {
            if let Some((pid, blp)) = entries.last_mut() {
                let delta = seq.wrapping_sub(*pid);
                if (1..=16).contains(&delta) {
                    *blp |= 1 << (delta - 1);
                    continue;
                }
            }
            entries.push((seq, 0));
        }
        NackPacket {
            sender_ssrc,
            media_ssrc,
            entries,
        }
    }
}

/// Retains the last K frames' packets for NACK-driven resend.
#[derive(Debug)]
pub struct RetransmitBuffer {
    /// Per retained frame: `(low 16 bits of sequence, packet bytes)`.
    frames: VecDeque<Vec<(u16, Vec<u8>)>>,
    capacity_frames: usize,
}

impl RetransmitBuffer {
    pub fn new(capacity_frames: usize) -> Self {
        RetransmitBuffer {
            frames: VecDeque::new(),
            capacity_frames: capacity_frames.max(1),
        }
    }

    /// Retain one transmitted frame's packets, evicting the oldest frame
    /// beyond capacity.
    pub fn push_frame(&mut self, packets: Vec<(u16, Vec<u8>)>) {
        if self.frames.len() == self.capacity_frames {
            self.frames.pop_front();
        }
        self.frames.push_back(packets);
    }

    /// Find a retained packet by the low 16 bits of its sequence number.
    pub fn lookup(&self, seq: u16) -> Option<&[u8]> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.iter().find(|(s, _)| *s == seq))
            .map(|(_, data)| data.as_slice())
    }

    /// Collect the resend list for a NACK.
    pub fn resend_for(&self, nack: &NackPacket) -> Vec<Vec<u8>> {
        nack.lost_sequences()
            .into_iter()
            .filter_map(|seq| self.lookup(seq).map(|p| p.to_vec()))
            .collect()
    }

    pub fn retained_frames(&self) -> usize {
        self.frames.len()
    }
}
