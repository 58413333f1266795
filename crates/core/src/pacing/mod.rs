//! Transmit pacing per SMPTE ST 2110-21.
//!
//! Every frame is tied to an *epoch* — the PTP-aligned boundary
//! `epoch_start = ⌈tai / T_frame⌉ × T_frame`. Within an epoch, packet `k`
//! launches at
//!
//! ```text
//! tx(k) = epoch_start + TRO + k × TRS
//! TRS   = T_frame × (1 − TRO_fraction) / N_pkts
//! ```
//!
//! where the TRO fraction comes from the pacing profile and the line count
//! of the video system (narrow 43/1125 and wide 20/1125 for 1125-line
//! systems). Interlaced sessions pace each field as a frame at twice the
//! rate.
//!
//! The VRX bucket models receiver ingress buffering: each emitted packet
//! moves the signed bucket by `packet_bits − TRS × link_rate`; a sustained
//! positive excursion means the sender is running hot.

use crate::error::{Result, TransportError};
use crate::frame::{Fps, NS_PER_S, VIDEO_CLOCK_RATE};

/// ST 2110-21 sender profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingProfile {
    /// Gapped, tightly metered sender (type N).
    #[default]
    Narrow,
    /// Linear sender with relaxed per-packet jitter (type W).
    Wide,
}

/// How packet launch times reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingMethod {
    /// NIC hardware rate limiter meters the stream; only the frame start
    /// is scheduled.
    #[default]
    RateLimiter,
    /// CPU timestamp-counter spin until each packet's target.
    Tsc,
    /// Per-packet launch time attached to the NIC descriptor.
    Tsn,
}

/// TRO fraction `(offset_lines, total_lines)` for a video system.
///
/// 1125-line values follow ST 2110-21 directly; the shorter systems carry
/// the conventional read-out offsets for their line counts.
fn tr_offset_fraction(profile: PacingProfile, height: u32) -> (u64, u64) {
    match profile {
        PacingProfile::Narrow => match height {
            h if h >= 1080 => (43, 1125),
            h if h >= 720 => (28, 750),
            576 => (26, 625),
            480 => (20, 525),
            _ => (43, 1125),
        },
        PacingProfile::Wide => match height {
            h if h >= 1080 => (20, 1125),
            h if h >= 720 => (14, 750),
            576 => (13, 625),
            480 => (10, 525),
            _ => (20, 1125),
        },
    }
}

/// Nominal TRS for a stream, as the receive-side timing parser models it.
pub fn nominal_trs_ns(
    profile: PacingProfile,
    fps: Fps,
    height: u32,
    interlaced: bool,
    total_pkts: u32,
) -> f64 {
    let mut period = fps.frame_time_ns();
    if interlaced {
        period /= 2;
    }
    let (off_num, off_den) = tr_offset_fraction(profile, height);
    let tr_offset = period * off_num / off_den;
    (period - tr_offset) as f64 / total_pkts.max(1) as f64
}

/// Pacer construction parameters.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub profile: PacingProfile,
    pub method: PacingMethod,
    pub fps: Fps,
    pub height: u32,
    pub interlaced: bool,
    /// Packets per frame/field, from the codec geometry.
    pub total_pkts: u32,
    /// Link rate in bits per second, for VRX accounting.
    pub link_rate_bps: u64,
    /// Initial VRX bucket bias in bits. Default 0.
    pub start_vrx_bits: i64,
}

/// Snapshot of the derived pacing values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingParams {
    pub tr_offset_ns: u64,
    pub trs_ns: f64,
    pub vrx_bits: i64,
}

/// One frame's transmit schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedule {
    pub epoch: u64,
    pub epoch_start_ns: u64,
    /// `epoch_start + TRO`: launch time of packet 0.
    pub first_tx_ns: u64,
    /// 90 kHz media clock value of the epoch.
    pub rtp_timestamp: u32,
}

/// Per-session transmit pacer.
#[derive(Debug)]
pub struct Pacer {
    method: PacingMethod,
    /// Frame period, or field period when interlaced.
    period_ns: u64,
    tr_offset_ns: u64,
    trs_ns: f64,
    total_pkts: u32,
    link_rate_bps: u64,
    vrx_bits: i64,
    /// Next epoch this session may transmit in.
    next_epoch: u64,
}

impl Pacer {
    pub fn new(cfg: &PacingConfig) -> Result<Self> {
        if cfg.total_pkts == 0 {
            return Err(TransportError::InvalidArgument("zero packets per frame".into()));
        }
        if cfg.link_rate_bps == 0 {
            return Err(TransportError::InvalidArgument("zero link rate".into()));
        }
        let mut period_ns = cfg.fps.frame_time_ns();
        if cfg.interlaced {
            period_ns /= 2;
        }
        let (off_num, off_den) = tr_offset_fraction(cfg.profile, cfg.height);
        let tr_offset_ns = period_ns * off_num / off_den;
        let trs_ns = (period_ns - tr_offset_ns) as f64 / cfg.total_pkts as f64;
        Ok(Pacer {
            method: cfg.method,
            period_ns,
            tr_offset_ns,
            trs_ns,
            total_pkts: cfg.total_pkts,
            link_rate_bps: cfg.link_rate_bps,
            vrx_bits: cfg.start_vrx_bits,
            next_epoch: 0,
        })
    }

    pub fn method(&self) -> PacingMethod {
        self.method
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn params(&self) -> PacingParams {
        PacingParams {
            tr_offset_ns: self.tr_offset_ns,
            trs_ns: self.trs_ns,
            vrx_bits: self.vrx_bits,
        }
    }

    pub fn epoch_start_ns(&self, epoch: u64) -> u64 {
        epoch * self.period_ns
    }

    /// First epoch whose boundary is at or after `tai_ns`.
    pub fn epoch_at_or_after(&self, tai_ns: u64) -> u64 {
        tai_ns.div_ceil(self.period_ns)
    }

    /// 90 kHz media clock value of an epoch boundary, modulo 2³².
    pub fn rtp_timestamp(&self, epoch_start_ns: u64) -> u32 {
        ((epoch_start_ns as u128 * VIDEO_CLOCK_RATE as u128) / NS_PER_S as u128) as u32
    }

    /// Epoch the next transmit is owed to, without claiming it.
    pub fn pending_epoch(&self, now_ns: u64) -> u64 {
        self.epoch_at_or_after(now_ns).max(self.next_epoch)
    }

    /// Claim the next transmit epoch: at or after `now_ns`, strictly after
    /// any previously claimed epoch, so RTP timestamps strictly increase.
    pub fn claim_epoch(&mut self, now_ns: u64) -> FrameSchedule {
        let epoch = self.pending_epoch(now_ns);
        self.next_epoch = epoch + 1;
        let epoch_start_ns = self.epoch_start_ns(epoch);
        FrameSchedule {
            epoch,
            epoch_start_ns,
            first_tx_ns: epoch_start_ns + self.tr_offset_ns,
            rtp_timestamp: self.rtp_timestamp(epoch_start_ns),
        }
    }

    /// Skip one epoch (late frame), keeping the monotonic claim order.
    pub fn skip_epoch(&mut self, epoch: u64) {
        self.next_epoch = self.next_epoch.max(epoch + 1);
    }

    /// Whether the dequeue point for `epoch` has passed beyond tolerance:
    /// one TRS past the first launch slot.
    pub fn is_late(&self, epoch: u64, now_ns: u64) -> bool {
        now_ns as f64 > self.epoch_start_ns(epoch) as f64 + self.tr_offset_ns as f64 + self.trs_ns
    }

    /// Launch time of packet `k` within a scheduled frame.
    ///
    /// Rate-limiter mode stamps only packet 0 and leaves the remainder to
    /// the NIC's hardware meter (launch time 0 = unscheduled).
    pub fn launch_time(&self, sched: &FrameSchedule, k: u32) -> u64 {
        match self.method {
            PacingMethod::RateLimiter if k > 0 => 0,
            _ => sched.first_tx_ns + (k as f64 * self.trs_ns) as u64,
        }
    }

    /// Account one emitted packet against the VRX bucket and return the
    /// new level in bits.
    pub fn vrx_account(&mut self, pkt_bytes: usize) -> i64 {
        let drained = self.trs_ns * self.link_rate_bps as f64 / NS_PER_S as f64;
        self.vrx_bits += (pkt_bytes * 8) as i64 - drained as i64;
        self.vrx_bits
    }

    pub fn vrx_bits(&self) -> i64 {
        self.vrx_bits
    }

    pub fn total_pkts(&self) -> u32 {
        self.total_pkts
    }
}
