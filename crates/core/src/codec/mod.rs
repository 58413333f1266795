//! RFC 4175 codec: packet geometry, packetizer, and depacketizer.
//!
//! The codec serializes one frame (or one field of an interlaced frame)
//! into `N` RTP packets, where `N` is fixed at session creation from the
//! packing mode, the frame geometry, and the wire format's pixel group.
//!
//! ## Packing modes (SMPTE ST 2110-20 §6.3)
//!
//! | Mode | Payload | Extra SRD |
//! |------|---------|-----------|
//! | [`PackingMode::SingleLine`] | up to one scanline per packet | never |
//! | [`PackingMode::BlockPacking`] | fixed 1260 bytes | when crossing a scanline |
//! | [`PackingMode::GeneralPacking`] | MTU budget rounded to pixel groups | always reserved |

pub mod depacketizer;
pub mod packet;
pub mod packetizer;

use crate::error::{Result, TransportError};
use crate::frame::PixelFormat;
use packet::{PKT_MAX_UDP_BYTES, RFC4175_HDR_SIZE, SRD_SIZE};

pub use depacketizer::{Depacketizer, RxPacketOutcome};
pub use packetizer::{FrameCursor, Packetizer};

/// How pixel groups are distributed across packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingMode {
    /// Each packet carries pixels from exactly one scanline.
    SingleLine,
    /// Fixed 1260-byte payloads that may cross scanlines.
    BlockPacking,
    /// Largest pixel-group multiple fitting the MTU budget; packets may
    /// cross scanlines.
    GeneralPacking,
}

impl PackingMode {
    pub fn name(&self) -> &'static str {
        match self {
            PackingMode::SingleLine => "gpm-sl",
            PackingMode::BlockPacking => "bpm",
            PackingMode::GeneralPacking => "gpm",
        }
    }
}

/// Fixed payload size of block-packing mode.
pub const BPM_PAYLOAD_BYTES: usize = 1260;

/// Scanline index limit: 15-bit row-number field.
const ROW_MAX: u32 = 0x7fff;

/// Packet count for the crossing modes, walking scan order the way the
/// packetizer does. A packet carries at most `payload_max` bytes and spans
/// at most two rows (one continuation SRD), so the count exceeds the naive
/// `ceil(frame / payload)` when a line is shorter than the payload budget.
fn walk_pkts(payload_max: usize, line_bytes: usize, frame_bytes: usize) -> u32 {
    let mut pos = 0usize;
    let mut n = 0u32;
    while pos < frame_bytes {
        let line_remaining = line_bytes - pos % line_bytes;
        let budget = payload_max.min(frame_bytes - pos);
        let take = if budget <= line_remaining {
            budget
        } else {
            line_remaining + (budget - line_remaining).min(line_bytes)
        };
        pos += take;
        n += 1;
    }
    n
}

/// Per-session packet layout derived once at creation.
#[derive(Debug, Clone, Copy)]
pub struct PacketGeometry {
    pub mode: PackingMode,
    pub width: u32,
    /// Lines of pixel data carried per transmission unit: frame height for
    /// progressive, field height for interlaced.
    pub data_height: u32,
    /// Pixels per group of the wire format.
    pub pg_coverage: u32,
    /// Bytes per group of the wire format.
    pub pg_size: u32,
    /// Bytes in one scanline.
    pub line_bytes: usize,
    /// Largest pixel payload one packet may carry.
    pub payload_max: usize,
    /// Packets per scanline (single-line mode only, else 0).
    pub pkts_in_line: u32,
    /// Packets per frame/field.
    pub total_pkts: u32,
}

impl PacketGeometry {
    /// Compute the layout for a session.
    ///
    /// Fails with `InvalidArgument` when the width is not a whole number of
    /// pixel groups, a dimension is zero or exceeds the 15-bit row/offset
    /// fields, or the fixed block-packing payload cannot hold a group.
    pub fn new(
        mode: PackingMode,
        fmt: PixelFormat,
        width: u32,
        height: u32,
        interlaced: bool,
    ) -> Result<Self> {
        let (pg_coverage, pg_size) = fmt.pixel_group();
        if width == 0 || height == 0 {
            return Err(TransportError::InvalidArgument(format!(
                "dimensions {width}x{height}"
            )));
        }
        if width > ROW_MAX + 1 || height > ROW_MAX + 1 {
            return Err(TransportError::InvalidArgument(format!(
                "dimensions {width}x{height} exceed the 15-bit srd fields"
            )));
        }
        if width % pg_coverage != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "width {} not a multiple of the {}-pixel group of {}",
                width,
                pg_coverage,
                fmt.name()
            )));
        }
        if interlaced && height % 2 != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "interlaced height {height} must be even"
            )));
        }
        let data_height = if interlaced { height / 2 } else { height };
        let line_bytes = (width / pg_coverage) as usize * pg_size as usize;
        let frame_bytes = line_bytes * data_height as usize;

        let (payload_max, pkts_in_line, total_pkts) = match mode {
            PackingMode::SingleLine => {
                let budget = PKT_MAX_UDP_BYTES - RFC4175_HDR_SIZE;
                let payload = (budget / pg_size as usize) * pg_size as usize;
                let pkts_in_line = line_bytes.div_ceil(payload) as u32;
                (
                    payload.min(line_bytes),
                    pkts_in_line,
                    data_height * pkts_in_line,
                )
            }
            PackingMode::BlockPacking => {
                if BPM_PAYLOAD_BYTES % pg_size as usize != 0 {
                    return Err(TransportError::InvalidArgument(format!(
                        "block payload {} not a multiple of {}-byte groups",
                        BPM_PAYLOAD_BYTES, pg_size
                    )));
                }
                let total = walk_pkts(BPM_PAYLOAD_BYTES, line_bytes, frame_bytes);
                (BPM_PAYLOAD_BYTES, 0, total)
            }
            PackingMode::GeneralPacking => {
                let budget = PKT_MAX_UDP_BYTES - RFC4175_HDR_SIZE - SRD_SIZE;
                let payload = (budget / pg_size as usize) * pg_size as usize;
                let total = walk_pkts(payload, line_bytes, frame_bytes);
                (payload, 0, total)
            }
        };

        Ok(PacketGeometry {
            mode,
            width,
            data_height,
            pg_coverage,
            pg_size,
            line_bytes,
            payload_max,
            pkts_in_line,
            total_pkts,
        })
    }

    /// Bytes of pixel data in one frame/field on the wire.
    pub fn frame_bytes(&self) -> usize {
        self.line_bytes * self.data_height as usize
    }

    /// Byte position inside the wire buffer for `(row, pixel offset)`.
    pub fn byte_at(&self, row: u32, offset_pixels: u32) -> usize {
        row as usize * self.line_bytes
            + (offset_pixels / self.pg_coverage) as usize * self.pg_size as usize
    }
}
