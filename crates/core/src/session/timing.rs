//! RX timing parser: per-frame arrival analysis against ST 2110-21.
//!
//! The parser models the receiver's virtual buffer: every packet arrival
//! adds one, and the buffer drains at one packet per TRS from the first
//! arrival. The excursion of that bucket plus the raw inter-packet gap
//! extrema give a narrow/wide/fail verdict per frame, reported as a
//! session event and folded into aggregate stats.

/// VRX-full bound for a narrow (type N) sender, in packets.
pub const VRX_FULL_NARROW: i64 = 8;

/// VRX-full bound for a wide (type W) sender, in packets.
pub const VRX_FULL_WIDE: i64 = 720;

/// Per-frame compliance verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingCompliance {
    Narrow,
    Wide,
    Failed,
}

/// One frame's timing analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingReport {
    pub rtp_timestamp: u32,
    pub pkts: u32,
    /// Smallest and largest gap between consecutive packet arrivals.
    pub ipt_min_ns: u64,
    pub ipt_max_ns: u64,
    /// Extremes of the modeled receive buffer, in packets.
    pub vrx_min: i64,
    pub vrx_max: i64,
    pub compliance: TimingCompliance,
}

/// Running aggregate over delivered reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSummary {
    pub frames: u64,
    pub narrow: u64,
    pub wide: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct FrameObservation {
    rtp_timestamp: u32,
    first_arrival_ns: u64,
    prev_arrival_ns: u64,
    pkts: u32,
    ipt_min_ns: u64,
    ipt_max_ns: u64,
    vrx_min: i64,
    vrx_max: i64,
}

/// Stateful per-session timing parser.
#[derive(Debug)]
pub struct TimingParser {
    trs_ns: f64,
    current: Option<FrameObservation>,
    summary: TimingSummary,
}

impl TimingParser {
    pub fn new(trs_ns: f64) -> Self {
        TimingParser {
            trs_ns,
            current: None,
            summary: TimingSummary::default(),
        }
    }

    /// Record one packet arrival for the frame keyed by `rtp_timestamp`.
    ///
    /// A new timestamp closes the previous frame and returns its report.
    pub fn on_packet(&mut self, rtp_timestamp: u32, arrival_ns: u64) -> Option<TimingReport> {
        let mut closed = None;
        if self
            .current
            .as_ref()
            .is_some_and(|o| o.rtp_timestamp != rtp_timestamp)
        {
            closed = self.finish();
        }
        let obs = self.current.get_or_insert_with(|| FrameObservation {
            rtp_timestamp,
            first_arrival_ns: arrival_ns,
            prev_arrival_ns: arrival_ns,
            ipt_min_ns: u64::MAX,
            ..Default::default()
        });
        if obs.pkts > 0 {
            let gap = arrival_ns.saturating_sub(obs.prev_arrival_ns);
            obs.ipt_min_ns = obs.ipt_min_ns.min(gap);
            obs.ipt_max_ns = obs.ipt_max_ns.max(gap);
        }
        obs.pkts += 1;
        obs.prev_arrival_ns = arrival_ns;

        // buffer model: arrivals add one, drain is one per TRS
        let elapsed = arrival_ns.saturating_sub(obs.first_arrival_ns) as f64;
        let drained = (elapsed / self.trs_ns) as i64;
        let level = obs.pkts as i64 - drained;
        obs.vrx_min = obs.vrx_min.min(level);
        obs.vrx_max = obs.vrx_max.max(level);

        closed
    }

    /// Close the current frame and produce its report.
    pub fn finish(&mut self) -> Option<TimingReport> {
        let obs = self.current.take()?;
        let compliance = if obs.vrx_max <= VRX_FULL_NARROW {
            TimingCompliance::Narrow
        } else if obs.vrx_max <= VRX_FULL_WIDE {
            TimingCompliance::Wide
        } else {
            TimingCompliance::Failed
        };
        self.summary.frames += 1;
        match compliance {
            TimingCompliance::Narrow => self.summary.narrow += 1,
            TimingCompliance::Wide => self.summary.wide += 1,
            TimingCompliance::Failed => self.summary.failed += 1,
        }
        Some(TimingReport {
            rtp_timestamp: obs.rtp_timestamp,
            pkts: obs.pkts,
            ipt_min_ns: if obs.ipt_min_ns == u64::MAX {
                0
            } else {
                obs.ipt_min_ns
            },
            ipt_max_ns: obs.ipt_max_ns,
            vrx_min: obs.vrx_min,
            vrx_max: obs.vrx_max,
            compliance,
        })
    }

    pub fn summary(&self) -> TimingSummary {
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paced_arrivals_verdict_narrow() {
        let trs = 1000.0;
        let mut p = TimingParser::new(trs);
        for k in 0..100u64 {
            assert!(p.on_packet(5000, k * 1000).is_none());
        }
        let report = p.finish().unwrap();
        assert_eq!(report.pkts, 100);
        assert_eq!(report.compliance, TimingCompliance::Narrow);
        assert_eq!(report.ipt_min_ns, 1000);
        assert_eq!(report.ipt_max_ns, 1000);
        assert!(report.vrx_max <= VRX_FULL_NARROW);
    }

    #[test]
    fn bursty_arrivals_verdict_degrades() {
        let trs = 1000.0;
        let mut p = TimingParser::new(trs);
        // 100 packets at once: buffer peaks at 100
        for _ in 0..100u64 {
            p.on_packet(1, 0);
        }
        let report = p.finish().unwrap();
        assert_eq!(report.compliance, TimingCompliance::Wide);
        assert_eq!(report.vrx_max, 100);

        let mut p = TimingParser::new(trs);
        for _ in 0..1000u64 {
            p.on_packet(2, 0);
        }
        assert_eq!(p.finish().unwrap().compliance, TimingCompliance::Failed);
    }

    #[test]
    fn new_timestamp_closes_previous_frame() {
        let mut p = TimingParser::new(1000.0);
        p.on_packet(10, 0);
        p.on_packet(10, 1000);
        let closed = p.on_packet(11, 50_000).unwrap();
        assert_eq!(closed.rtp_timestamp, 10);
        assert_eq!(closed.pkts, 2);
        assert_eq!(p.summary().frames, 1);
        assert!(p.finish().is_some());
        assert_eq!(p.summary().frames, 2);
    }
}
