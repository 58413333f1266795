//! Frame data model: pixel formats, frame rates, and the [`Frame`] type.
//!
//! A frame travels the engine in one of two format families:
//!
//! - **Surface formats** — what the application reads/writes: planar YUV at
//!   8/10/12 bits little-endian, the packed V210/Y210 layouts, packed RGB,
//!   and the GBR planar variants.
//! - **Wire formats** — the RFC 4175 big-endian pixel-group layouts carried
//!   on the network (SMPTE ST 2110-20 §6). Two 10-bit 4:2:2 pixels occupy
//!   5 bytes; 12-bit groups pack 2 pixels into 9 bytes; 4:4:4/RGB at 10 bit
//!   pack 4 pixels into 15 bytes.
//!
//! When the surface format equals the wire format the pipeline runs in
//! *derive mode*: the application buffer is the wire-side buffer and no
//! pixel copy occurs.

pub mod ring;

use crate::error::{Result, TransportError};

/// Maximum number of planes a pixel format can carry.
pub const MAX_PLANES: usize = 4;

/// Maximum session ports (primary + redundant).
pub const MAX_PORTS: usize = 2;

/// Pixel format of a frame buffer, covering both surface and wire layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:2, 8 bit.
    Yuv422Planar8,
    /// Planar YUV 4:2:0, 8 bit.
    Yuv420Planar8,
    /// Packed UYVY 4:2:2, 8 bit.
    Uyvy,
    /// Planar YUV 4:2:2, 10 bit little-endian in 16-bit containers.
    Yuv422Planar10Le,
    /// Planar YUV 4:2:2, 12 bit little-endian in 16-bit containers.
    Yuv422Planar12Le,
    /// Planar YUV 4:4:4, 10 bit little-endian in 16-bit containers.
    Yuv444Planar10Le,
    /// Planar YUV 4:4:4, 12 bit little-endian in 16-bit containers.
    Yuv444Planar12Le,
    /// Packed 4:2:2 10 bit, 6 pixels in 16 bytes, 128-byte line alignment.
    V210,
    /// Packed 4:2:2 10 bit in 16-bit containers, 4 bytes per pixel.
    Y210,
    /// Packed RGB, 8 bit, 3 bytes per pixel.
    Rgb8,
    /// Planar GBR, 10 bit little-endian in 16-bit containers.
    GbrPlanar10Le,
    /// Planar GBR, 12 bit little-endian in 16-bit containers.
    GbrPlanar12Le,
    /// RFC 4175 4:2:2 10-bit big-endian pixel groups (2 pixels / 5 bytes).
    Yuv422Rfc4175Be10,
    /// RFC 4175 4:2:2 12-bit big-endian pixel groups (2 pixels / 6 bytes).
    Yuv422Rfc4175Be12,
    /// RFC 4175 4:4:4 10-bit big-endian pixel groups (4 pixels / 15 bytes).
    Yuv444Rfc4175Be10,
    /// RFC 4175 4:4:4 12-bit big-endian pixel groups (2 pixels / 9 bytes).
    Yuv444Rfc4175Be12,
    /// RFC 4175 RGB 10-bit big-endian pixel groups (4 pixels / 15 bytes).
    RgbRfc4175Be10,
    /// RFC 4175 RGB 12-bit big-endian pixel groups (2 pixels / 9 bytes).
    RgbRfc4175Be12,
}

impl PixelFormat {
    /// The indivisible pixel group of this format:
    /// `(pixels covered, bytes occupied)`.
    pub fn pixel_group(&self) -> (u32, u32) {
        use PixelFormat::*;
        match self {
            Yuv422Planar8 => (2, 4),
            Yuv420Planar8 => (2, 3),
            Uyvy => (2, 4),
            Yuv422Planar10Le => (2, 8),
            Yuv422Planar12Le => (2, 8),
            Yuv444Planar10Le => (1, 6),
            Yuv444Planar12Le => (1, 6),
            V210 => (6, 16),
            Y210 => (2, 8),
            Rgb8 => (1, 3),
            GbrPlanar10Le => (1, 6),
            GbrPlanar12Le => (1, 6),
            Yuv422Rfc4175Be10 => (2, 5),
            Yuv422Rfc4175Be12 => (2, 6),
            Yuv444Rfc4175Be10 => (4, 15),
            Yuv444Rfc4175Be12 => (2, 9),
            RgbRfc4175Be10 => (4, 15),
            RgbRfc4175Be12 => (2, 9),
        }
    }

    /// Number of planes the format stores data in.
    pub fn planes(&self) -> usize {
        use PixelFormat::*;
        match self {
            Yuv422Planar8 | Yuv420Planar8 => 3,
            Yuv422Planar10Le | Yuv422Planar12Le => 3,
            Yuv444Planar10Le | Yuv444Planar12Le => 3,
            GbrPlanar10Le | GbrPlanar12Le => 3,
            Uyvy | V210 | Y210 | Rgb8 => 1,
            Yuv422Rfc4175Be10 | Yuv422Rfc4175Be12 | Yuv444Rfc4175Be10 | Yuv444Rfc4175Be12
            | RgbRfc4175Be10 | RgbRfc4175Be12 => 1,
        }
    }

    /// Minimum line size in bytes for `plane` at `width` pixels.
    pub fn least_linesize(&self, width: u32, plane: usize) -> usize {
        use PixelFormat::*;
        let w = width as usize;
        match self {
            Yuv422Planar8 => {
                if plane == 0 {
                    w
                } else {
                    w / 2
                }
            }
            Yuv420Planar8 => {
                if plane == 0 {
                    w
                } else {
                    w / 2
                }
            }
            Uyvy => w * 2,
            Yuv422Planar10Le | Yuv422Planar12Le => {
                if plane == 0 {
                    w * 2
                } else {
                    w
                }
            }
            Yuv444Planar10Le | Yuv444Planar12Le | GbrPlanar10Le | GbrPlanar12Le => w * 2,
            // 48-pixel groups pad each V210 line to a 128-byte multiple
            V210 => w.div_ceil(48) * 128,
            Y210 => w * 4,
            Rgb8 => w * 3,
            _ => {
                let (coverage, size) = self.pixel_group();
                w.div_ceil(coverage as usize) * size as usize
            }
        }
    }

    /// Height in lines of `plane` for a frame of data height `height`.
    pub fn plane_height(&self, height: u32, plane: usize) -> usize {
        let h = height as usize;
        match self {
            PixelFormat::Yuv420Planar8 if plane > 0 => h / 2,
            _ => h,
        }
    }

    /// Total frame buffer size in bytes.
    ///
    /// For interlaced video a frame buffer holds a single field, so the
    /// data height is half the frame height.
    pub fn frame_size(&self, width: u32, height: u32, interlaced: bool) -> usize {
        let h = if interlaced { height / 2 } else { height };
        (0..self.planes())
            .map(|p| self.least_linesize(width, p) * self.plane_height(h, p))
            .sum()
    }

    /// Whether this is an on-wire RFC 4175 layout.
    pub fn is_wire(&self) -> bool {
        use PixelFormat::*;
        matches!(
            self,
            Yuv422Rfc4175Be10
                | Yuv422Rfc4175Be12
                | Yuv444Rfc4175Be10
                | Yuv444Rfc4175Be12
                | RgbRfc4175Be10
                | RgbRfc4175Be12
        )
    }

    /// Short lowercase name for logs.
    pub fn name(&self) -> &'static str {
        use PixelFormat::*;
        match self {
            Yuv422Planar8 => "yuv422p",
            Yuv420Planar8 => "yuv420p",
            Uyvy => "uyvy",
            Yuv422Planar10Le => "yuv422p10le",
            Yuv422Planar12Le => "yuv422p12le",
            Yuv444Planar10Le => "yuv444p10le",
            Yuv444Planar12Le => "yuv444p12le",
            V210 => "v210",
            Y210 => "y210",
            Rgb8 => "rgb8",
            GbrPlanar10Le => "gbrp10le",
            GbrPlanar12Le => "gbrp12le",
            Yuv422Rfc4175Be10 => "yuv422rfc4175be10",
            Yuv422Rfc4175Be12 => "yuv422rfc4175be12",
            Yuv444Rfc4175Be10 => "yuv444rfc4175be10",
            Yuv444Rfc4175Be12 => "yuv444rfc4175be12",
            RgbRfc4175Be10 => "rgbrfc4175be10",
            RgbRfc4175Be12 => "rgbrfc4175be12",
        }
    }
}

/// On-wire ST 2110-20 transport format (the sampling/depth the RTP payload
/// carries). Each maps to exactly one wire [`PixelFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFormat {
    Yuv422_10bit,
    Yuv422_12bit,
    Yuv444_10bit,
    Yuv444_12bit,
    Rgb10bit,
    Rgb12bit,
}

impl TransportFormat {
    /// The RFC 4175 pixel-group layout this transport format carries.
    pub fn to_pixel_format(&self) -> PixelFormat {
        match self {
            TransportFormat::Yuv422_10bit => PixelFormat::Yuv422Rfc4175Be10,
            TransportFormat::Yuv422_12bit => PixelFormat::Yuv422Rfc4175Be12,
            TransportFormat::Yuv444_10bit => PixelFormat::Yuv444Rfc4175Be10,
            TransportFormat::Yuv444_12bit => PixelFormat::Yuv444Rfc4175Be12,
            TransportFormat::Rgb10bit => PixelFormat::RgbRfc4175Be10,
            TransportFormat::Rgb12bit => PixelFormat::RgbRfc4175Be12,
        }
    }

    /// The transport format carrying a wire pixel layout; `None` for
    /// surface formats, which never appear on the wire.
    pub fn from_pixel_format(fmt: PixelFormat) -> Option<TransportFormat> {
        match fmt {
            PixelFormat::Yuv422Rfc4175Be10 => Some(TransportFormat::Yuv422_10bit),
            PixelFormat::Yuv422Rfc4175Be12 => Some(TransportFormat::Yuv422_12bit),
            PixelFormat::Yuv444Rfc4175Be10 => Some(TransportFormat::Yuv444_10bit),
            PixelFormat::Yuv444Rfc4175Be12 => Some(TransportFormat::Yuv444_12bit),
            PixelFormat::RgbRfc4175Be10 => Some(TransportFormat::Rgb10bit),
            PixelFormat::RgbRfc4175Be12 => Some(TransportFormat::Rgb12bit),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportFormat::Yuv422_10bit => "422-10",
            TransportFormat::Yuv422_12bit => "422-12",
            TransportFormat::Yuv444_10bit => "444-10",
            TransportFormat::Yuv444_12bit => "444-12",
            TransportFormat::Rgb10bit => "rgb-10",
            TransportFormat::Rgb12bit => "rgb-12",
        }
    }
}

/// Frame rate as an exact rational, covering the broadcast rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fps {
    P23_98,
    P24,
    P25,
    P29_97,
    P30,
    P50,
    P59_94,
    P60,
    P100,
    P119_88,
    P120,
}

/// RTP media clock rate for uncompressed video (RFC 4175 §4.2).
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

pub(crate) const NS_PER_S: u64 = 1_000_000_000;

impl Fps {
    /// `(numerator, denominator)` of the exact rate.
    pub fn rational(&self) -> (u64, u64) {
        match self {
            Fps::P23_98 => (24_000, 1001),
            Fps::P24 => (24, 1),
            Fps::P25 => (25, 1),
            Fps::P29_97 => (30_000, 1001),
            Fps::P30 => (30, 1),
            Fps::P50 => (50, 1),
            Fps::P59_94 => (60_000, 1001),
            Fps::P60 => (60, 1),
            Fps::P100 => (100, 1),
            Fps::P119_88 => (120_000, 1001),
            Fps::P120 => (120, 1),
        }
    }

    /// Frame period in nanoseconds, rounded to the nearest ns.
    pub fn frame_time_ns(&self) -> u64 {
        let (num, den) = self.rational();
        (NS_PER_S * den + num / 2) / num
    }

    /// Nominal frames per second, rounded up for fractional rates.
    pub fn rate(&self) -> u64 {
        let (num, den) = self.rational();
        num.div_ceil(den)
    }

    /// 90 kHz ticks per frame, exact when integral.
    ///
    /// Fractional rates (59.94 et al.) do not divide 90000 evenly; the
    /// wire alternates e.g. 1501/1502 so the average is exact. Use
    /// [`crate::pacing`] epochs rather than accumulating this value.
    pub fn rtp_ticks_per_frame(&self) -> u64 {
        let (num, den) = self.rational();
        (VIDEO_CLOCK_RATE * den).div_ceil(num)
    }

    const ALL: [Fps; 11] = [
        Fps::P23_98,
        Fps::P24,
        Fps::P25,
        Fps::P29_97,
        Fps::P30,
        Fps::P50,
        Fps::P59_94,
        Fps::P60,
        Fps::P100,
        Fps::P119_88,
        Fps::P120,
    ];

    /// Match an observed per-frame 90 kHz delta against the known rates
    /// (format auto-detection). A ±1-tick tolerance absorbs the
    /// alternation of the 1000/1001 fractional rates without colliding
    /// with the neighbouring integral rate.
    pub fn from_rtp_ticks(delta: u32) -> Option<Fps> {
        Fps::ALL.into_iter().find(|fps| {
            let nominal = fps.rtp_ticks_per_frame() as i64;
            (delta as i64 - nominal).abs() <= 1
        })
    }
}

/// Completion status of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Every expected packet arrived on a single port.
    #[default]
    Complete,
    /// Complete only by merging the primary and redundant ports.
    Reconstructed,
    /// Missing packets; delivered only on explicit request.
    Corrupted,
}

/// Pixel storage backing a [`Frame`].
#[derive(Debug)]
pub enum FrameData {
    /// Pool allocation owned by the session ring.
    Owned(Vec<u8>),
    /// Caller-provided buffer installed via `put_ext_frame`; handed back
    /// through the frame-done notification.
    External { buf: Vec<u8>, iova: u64 },
    /// No backing yet (external-frame slots before the buffer arrives).
    Unset,
}

impl FrameData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FrameData::Owned(v) => v,
            FrameData::External { buf, .. } => buf,
            FrameData::Unset => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            FrameData::Owned(v) => v,
            FrameData::External { buf, .. } => buf,
            FrameData::Unset => &mut [],
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, FrameData::External { .. })
    }
}

/// Caller-owned pixel buffer for the zero-copy paths.
///
/// The engine takes ownership at `put_ext_frame` and returns the buffer
/// with the frame-done notification once the NIC has finished with it.
#[derive(Debug)]
pub struct ExtFrame {
    /// Contiguous backing allocation covering all planes.
    pub buf: Vec<u8>,
    /// IO virtual address from the DMA registry, 0 if unmapped.
    pub iova: u64,
    /// Byte offset of each plane inside `buf`.
    pub plane_offset: [usize; MAX_PLANES],
    /// Line stride of each plane.
    pub linesize: [usize; MAX_PLANES],
}

/// A logical video frame moving through a session ring.
#[derive(Debug)]
pub struct Frame {
    pub fmt: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    /// Odd field of an interlaced frame.
    pub second_field: bool,
    pub data: FrameData,
    /// Byte offset of each plane inside the backing buffer.
    pub plane_offset: [usize; MAX_PLANES],
    /// Line stride of each plane in bytes.
    pub linesize: [usize; MAX_PLANES],
    /// Capacity of the backing buffer.
    pub buffer_size: usize,
    /// Bytes of valid pixel data.
    pub data_size: usize,
    /// 90 kHz media clock value, modular 32-bit.
    pub rtp_timestamp: u32,
    /// PTP TAI time of the frame's epoch in nanoseconds.
    pub timestamp_ns: u64,
    /// Epoch index assigned by the pacer (TX) or derived on receive (RX).
    pub epoch: u64,
    pub status: FrameStatus,
    /// Packets this frame occupies on the wire.
    pub pkts_total: u32,
    /// Packets received so far, per session port.
    pub pkts_recv: [u32; MAX_PORTS],
    /// Opaque application tag carried with the frame.
    pub opaque: u64,
}

impl Frame {
    /// Build a frame descriptor with tightly packed planes over an owned
    /// zeroed buffer.
    pub fn alloc(fmt: PixelFormat, width: u32, height: u32, interlaced: bool) -> Result<Self> {
        let size = fmt.frame_size(width, height, interlaced);
        if size == 0 {
            return Err(TransportError::InvalidArgument(format!(
                "zero frame size for {}x{} {}",
                width,
                height,
                fmt.name()
            )));
        }
        let mut frame = Frame {
            fmt,
            width,
            height,
            interlaced,
            second_field: false,
            data: FrameData::Owned(vec![0u8; size]),
            plane_offset: [0; MAX_PLANES],
            linesize: [0; MAX_PLANES],
            buffer_size: size,
            data_size: size,
            rtp_timestamp: 0,
            timestamp_ns: 0,
            epoch: 0,
            status: FrameStatus::Complete,
            pkts_total: 0,
            pkts_recv: [0; MAX_PORTS],
            opaque: 0,
        };
        frame.init_planes();
        Ok(frame)
    }

    /// Frame descriptor with no backing yet (external-frame mode).
    pub fn unbacked(fmt: PixelFormat, width: u32, height: u32, interlaced: bool) -> Self {
        Frame {
            fmt,
            width,
            height,
            interlaced,
            second_field: false,
            data: FrameData::Unset,
            plane_offset: [0; MAX_PLANES],
            linesize: [0; MAX_PLANES],
            buffer_size: 0,
            data_size: 0,
            rtp_timestamp: 0,
            timestamp_ns: 0,
            epoch: 0,
            status: FrameStatus::Complete,
            pkts_total: 0,
            pkts_recv: [0; MAX_PORTS],
            opaque: 0,
        }
    }

    /// Lay out tightly packed plane offsets/strides for the current format.
    pub fn init_planes(&mut self) {
        let h = self.data_height();
        let mut offset = 0usize;
        for p in 0..self.fmt.planes() {
            self.plane_offset[p] = offset;
            self.linesize[p] = self.fmt.least_linesize(self.width, p);
            offset += self.linesize[p] * self.fmt.plane_height(h, p);
        }
    }

    /// Height of the stored pixel data (field height when interlaced).
    pub fn data_height(&self) -> u32 {
        if self.interlaced {
            self.height / 2
        } else {
            self.height
        }
    }

    /// Immutable view of one plane.
    pub fn plane(&self, p: usize) -> &[u8] {
        let start = self.plane_offset[p];
        let len = self.linesize[p] * self.fmt.plane_height(self.data_height(), p);
        &self.data.as_slice()[start..start + len]
    }

    /// Mutable view of one plane.
    pub fn plane_mut(&mut self, p: usize) -> &mut [u8] {
        let start = self.plane_offset[p];
        let len = self.linesize[p] * self.fmt.plane_height(self.data_height(), p);
        &mut self.data.as_mut_slice()[start..start + len]
    }

    /// Validate plane layout against the backing buffer.
    pub fn sanity_check(&self) -> Result<()> {
        let planes = self.fmt.planes();
        let h = self.data_height();
        for p in 0..planes {
            if self.linesize[p] < self.fmt.least_linesize(self.width, p) {
                return Err(TransportError::InvalidArgument(format!(
                    "plane {} linesize {} below minimum {}",
                    p,
                    self.linesize[p],
                    self.fmt.least_linesize(self.width, p)
                )));
            }
            let end = self.plane_offset[p] + self.linesize[p] * self.fmt.plane_height(h, p);
            if end > self.buffer_size {
                return Err(TransportError::InvalidArgument(format!(
                    "plane {} extends to {} past buffer of {}",
                    p, end, self.buffer_size
                )));
            }
        }
        Ok(())
    }
}
