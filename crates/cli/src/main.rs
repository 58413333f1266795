use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use st2110::frame::{Fps, PixelFormat, TransportFormat};
use st2110::session::{
    NullRxEvents, NullTxEvents, PollStatus, VideoRx, VideoRxConfig, VideoTx, VideoTxConfig,
};
use st2110::transport::loopback::LoopbackNic;
use st2110::transport::UptimeClock;
use st2110::TransportError;

#[derive(Parser)]
#[command(
    name = "st2110-loopback",
    about = "Run a TX and an RX session back to back over the in-memory NIC"
)]
struct Args {
    /// Frame width in pixels
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Frame height in lines
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Frames to carry before exiting
    #[arg(long, short, default_value_t = 120)]
    frames: u64,

    /// Frame ring capacity on both sides
    #[arg(long, default_value_t = 4)]
    ring: usize,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let instance = st2110::instance::acquire();
    let clock = Arc::new(UptimeClock::new());
    let (nic_tx, nic_rx) = LoopbackNic::pair();

    let tx = Arc::new(
        VideoTx::new(
            instance.clone(),
            clock.clone(),
            Box::new(nic_tx),
            Arc::new(NullTxEvents),
            VideoTxConfig {
                name: Some("loopback-tx".into()),
                width: args.width,
                height: args.height,
                fps: Fps::P59_94,
                input_fmt: PixelFormat::Yuv422Planar10Le,
                transport_fmt: TransportFormat::Yuv422_10bit,
                framebuff_cnt: args.ring,
                blocking_get: true,
                ..Default::default()
            },
        )
        .expect("tx session"),
    );
    let rx = Arc::new(
        VideoRx::new(
            instance,
            clock,
            vec![Box::new(nic_rx)],
            Arc::new(NullRxEvents),
            VideoRxConfig {
                name: Some("loopback-rx".into()),
                width: args.width,
                height: args.height,
                fps: Fps::P59_94,
                output_fmt: PixelFormat::Yuv422Planar10Le,
                transport_fmt: TransportFormat::Yuv422_10bit,
                framebuff_cnt: args.ring,
                blocking_get: true,
                enable_timing_parser: true,
                ..Default::default()
            },
        )
        .expect("rx session"),
    );
    tx.start().expect("tx start");
    rx.start().expect("rx start");

    // worker: drive both sessions on one polling loop
    let worker = {
        let tx = tx.clone();
        let rx = rx.clone();
        thread::spawn(move || loop {
            let tx_status = tx.poll();
            let rx_status = rx.poll();
            match (tx_status, rx_status) {
                (PollStatus::Idle, PollStatus::Idle) => {
                    if tx.state() != st2110::SessionState::Started {
                        break;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
                (PollStatus::Waiting { .. }, PollStatus::Idle) => {
                    thread::sleep(Duration::from_micros(100));
                }
                _ => {}
            }
        })
    };

    // producer: moving luma ramp
    let producer = {
        let tx = tx.clone();
        let frames = args.frames;
        thread::spawn(move || {
            for n in 0..frames {
                let mut tf = loop {
                    match tx.get_frame(Duration::from_millis(100)) {
                        Ok(tf) => break tf,
                        Err(TransportError::Timeout) => continue,
                        Err(e) => {
                            eprintln!("producer stopped: {e}");
                            return;
                        }
                    }
                };
                let shade = (n % 64) as u16;
                for pair in tf.frame.plane_mut(0).chunks_exact_mut(2) {
                    pair.copy_from_slice(&(0x100 + shade).to_le_bytes());
                }
                if tx.put_frame(tf).is_err() {
                    return;
                }
            }
        })
    };

    // consumer: count delivered frames
    let mut delivered = 0u64;
    while delivered < args.frames {
        match rx.get_frame(Duration::from_millis(200)) {
            Ok(frame) => {
                delivered += 1;
                rx.put_frame(frame).expect("slot return");
            }
            Err(TransportError::Timeout) | Err(TransportError::Busy) => {
                if producer.is_finished() && delivered > 0 {
                    // tail frames may repeat rather than advance; settle
                    break;
                }
            }
            Err(e) => {
                eprintln!("consumer stopped: {e}");
                break;
            }
        }
    }

    producer.join().expect("producer join");
    tx.stop();
    rx.stop();
    worker.join().expect("worker join");

    let tx_stats = tx.stats();
    let rx_stats = rx.stats();
    println!(
        "tx: {} frames, {} epochs missed; rx: {} frames, {} pkts, {} out-of-order",
        tx_stats.buffers_processed,
        tx_stats.epochs_missed,
        rx_stats.buffers_processed,
        rx_stats.pkts_received[0],
        rx_stats.pkts_out_of_order,
    );
    if let Some(summary) = rx.timing_summary() {
        println!(
            "timing: {} frames analysed, {} narrow, {} wide, {} failed",
            summary.frames, summary.narrow, summary.wide, summary.failed
        );
    }
}
