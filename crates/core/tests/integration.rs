//! End-to-end loopback: a planar 1080p59.94 producer through the RFC 4175
//! codec and the ST 2110-21 pacer into a receiving session, pixel-exact.
//!
//! Both sessions share a manually advanced PTP clock; the test plays the
//! role of the polling worker and steps time to each armed launch window.

use std::sync::Arc;
use std::time::Duration;

use st2110::frame::{Fps, PixelFormat, TransportFormat};
use st2110::instance::Instance;
use st2110::session::{
    MediaSession, NullRxEvents, NullTxEvents, PollStatus, VideoRx, VideoRxConfig, VideoTx,
    VideoTxConfig,
};
use st2110::transport::loopback::LoopbackNic;
use st2110::transport::ManualClock;
use st2110::{FrameStatus, SessionState, TransportError};

/// Packets of a 1080p 4:2:2 10-bit frame in block-packing mode:
/// 1920 × 1080 × 2.5 bytes at 1260 bytes per packet.
const PKTS_1080P_BPM: u64 = 4115;

struct Loopback {
    tx: VideoTx,
    rx: VideoRx,
    clock: Arc<ManualClock>,
}

fn loopback_1080p() -> Loopback {
    let instance = Instance::new();
    let clock = ManualClock::new(0);
    let (nic_tx, nic_rx) = LoopbackNic::pair();

    let tx = VideoTx::new(
        instance.clone(),
        clock.clone(),
        Box::new(nic_tx),
        Arc::new(NullTxEvents),
        VideoTxConfig {
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            input_fmt: PixelFormat::Yuv422Planar10Le,
            transport_fmt: TransportFormat::Yuv422_10bit,
            framebuff_cnt: 4,
            payload_type: 112,
            ssrc: Some(0x2110),
            drop_on_late: true,
            ..Default::default()
        },
    )
    .expect("tx session");

    let rx = VideoRx::new(
        instance,
        clock.clone(),
        vec![Box::new(nic_rx)],
        Arc::new(NullRxEvents),
        VideoRxConfig {
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            output_fmt: PixelFormat::Yuv422Planar10Le,
            transport_fmt: TransportFormat::Yuv422_10bit,
            framebuff_cnt: 4,
            payload_type: 112,
            ..Default::default()
        },
    )
    .expect("rx session");

    tx.start().expect("tx start");
    rx.start().expect("rx start");
    Loopback { tx, rx, clock }
}

/// Step the clock to the armed launch window, emit one frame, and drain
/// the receive side.
fn pump_frame(lb: &Loopback) -> PollStatus {
    let sent = loop {
        match lb.tx.poll() {
            PollStatus::Waiting { next_ns } => lb.clock.set(next_ns),
            other => break other,
        }
    };
    while matches!(lb.rx.poll(), PollStatus::Received { .. }) {}
    sent
}

fn produce_gradient(tx: &VideoTx, shade: u16) {
    let mut tf = tx.get_frame(Duration::from_millis(10)).expect("free slot");
    for plane in 0..3 {
        for pair in tf.frame.plane_mut(plane).chunks_exact_mut(2) {
            pair.copy_from_slice(&(0x80 + shade).to_le_bytes());
        }
    }
    tx.put_frame(tf).expect("put frame");
}

#[test]
fn carries_1080p5994_pixel_exact() {
    let lb = loopback_1080p();
    let mut timestamps = Vec::new();

    for n in 0..3u16 {
        produce_gradient(&lb.tx, n);
        let status = pump_frame(&lb);
        assert!(matches!(status, PollStatus::Sent { .. }), "frame {n}: {status:?}");

        let got = lb.rx.get_frame(Duration::ZERO).expect("delivered frame");
        assert_eq!(got.frame.status, FrameStatus::Complete);
        assert_eq!(got.frame.pkts_total as u64, PKTS_1080P_BPM);
        assert_eq!(got.frame.pkts_recv[0] as u64, PKTS_1080P_BPM);
        let y = got.frame.plane(0);
        assert_eq!(
            u16::from_le_bytes([y[0], y[1]]),
            0x80 + n,
            "luma of frame {n}"
        );
        timestamps.push(got.frame.rtp_timestamp);
        lb.rx.put_frame(got).expect("slot return");
    }

    // 90 kHz timestamps advance by the 59.94 Hz alternation
    for pair in timestamps.windows(2) {
        let delta = pair[1].wrapping_sub(pair[0]);
        assert!(delta == 1501 || delta == 1502, "delta {delta}");
    }

    let tx_stats = lb.tx.stats();
    let rx_stats = lb.rx.stats();
    assert_eq!(tx_stats.buffers_processed, 3);
    assert_eq!(tx_stats.epochs_missed, 0);
    assert_eq!(rx_stats.buffers_processed, 3);
    assert_eq!(rx_stats.pkts_received[0], 3 * PKTS_1080P_BPM);
    assert_eq!(rx_stats.pkts_out_of_order, 0);
}

#[test]
fn unified_session_boundary_dispatches() {
    let lb = loopback_1080p();
    let tx = MediaSession::Video20Tx(lb.tx);
    let rx = MediaSession::Video20Rx(lb.rx);

    assert_eq!(tx.state(), SessionState::Started);
    assert_eq!(rx.state(), SessionState::Started);

    if let MediaSession::Video20Tx(inner) = &tx {
        produce_gradient(inner, 1);
    }
    loop {
        match tx.poll() {
            PollStatus::Waiting { next_ns } => lb.clock.set(next_ns),
            PollStatus::Sent { .. } => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    while matches!(rx.poll(), PollStatus::Received { .. }) {}
    assert_eq!(rx.stats().buffers_processed, 1);

    tx.stop();
    rx.stop();
    assert_eq!(tx.state(), SessionState::Stopped);
    assert_eq!(rx.state(), SessionState::Stopped);
    assert_eq!(tx.poll(), PollStatus::Idle);
}

#[test]
fn stop_releases_blocked_consumer_with_ring_free() {
    let instance = Instance::new();
    let clock = ManualClock::new(0);
    let (_nic_tx, nic_rx) = LoopbackNic::pair();
    let rx = Arc::new(
        VideoRx::new(
            instance,
            clock,
            vec![Box::new(nic_rx)],
            Arc::new(NullRxEvents),
            VideoRxConfig {
                width: 256,
                height: 16,
                fps: Fps::P60,
                output_fmt: PixelFormat::Yuv422Rfc4175Be10,
                framebuff_cnt: 4,
                blocking_get: true,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    rx.start().unwrap();

    // no traffic: the consumer parks on the session condvar
    let waiter = {
        let rx = rx.clone();
        std::thread::spawn(move || rx.get_frame(Duration::from_secs(1)))
    };
    std::thread::sleep(Duration::from_millis(50));

    let t0 = std::time::Instant::now();
    rx.stop();
    match waiter.join().unwrap() {
        Err(TransportError::TryAgain) => {}
        other => panic!("expected TryAgain, got {other:?}"),
    }
    assert!(
        t0.elapsed() < Duration::from_millis(50),
        "blocked consumer must release promptly"
    );

    // stopping N times behaves like stopping once
    rx.stop();
    rx.stop();
    assert_eq!(rx.state(), SessionState::Stopped);
    assert_eq!(rx.stats().buffers_free as usize, 4);
}

#[test]
fn producer_can_drain_loaned_frames_after_stop() {
    let instance = Instance::new();
    let clock = ManualClock::new(0);
    let (nic_tx, _nic_rx) = LoopbackNic::pair();
    let tx = VideoTx::new(
        instance,
        clock,
        Box::new(nic_tx),
        Arc::new(NullTxEvents),
        VideoTxConfig {
            width: 256,
            height: 16,
            fps: Fps::P60,
            input_fmt: PixelFormat::Yuv422Rfc4175Be10,
            framebuff_cnt: 2,
            ..Default::default()
        },
    )
    .unwrap();
    tx.start().unwrap();

    let held = tx.get_frame(Duration::ZERO).unwrap();
    tx.stop();
    // the loan is still returnable so shutdown cannot strand the slot
    tx.put_frame(held).expect("put after stop");
    match tx.get_frame(Duration::ZERO) {
        Err(TransportError::TryAgain) => {}
        other => panic!("gets refuse after stop, got {other:?}"),
    }
}

#[test]
fn late_epochs_counted_against_stalled_producer() {
    let lb = loopback_1080p();
    produce_gradient(&lb.tx, 0);
    assert!(matches!(pump_frame(&lb), PollStatus::Sent { .. }));

    // producer stalls for two full epochs
    let mut missed = 0;
    for _ in 0..2 {
        match lb.tx.poll() {
            PollStatus::Waiting { next_ns } => {
                lb.clock.set(next_ns + 2_000_000);
                if matches!(lb.tx.poll(), PollStatus::Late { .. }) {
                    missed += 1;
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(missed, 2);
    assert_eq!(lb.tx.stats().epochs_missed, 2);

    // a fresh frame resumes the cadence
    produce_gradient(&lb.tx, 9);
    assert!(matches!(pump_frame(&lb), PollStatus::Sent { .. }));
    assert_eq!(lb.tx.stats().epochs_missed, 2);
}
