//! # st2110 — SMPTE ST 2110-20 media transport engine
//!
//! A Rust library for carrying uncompressed professional video over
//! RTP/UDP/IP with hardware-assisted packet pacing. It sits between an
//! application producing or consuming raw frames and a poll-mode NIC that
//! moves RTP packets at line rate.
//!
//! ## Protocol references
//!
//! | Spec | Topic | How this crate uses it |
//! |------|-------|------------------------|
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Fixed header, SSRC, sequence/timestamp semantics |
//! | [RFC 4175](https://tools.ietf.org/html/rfc4175) | Uncompressed video payload | Pixel-group payloads, SRD headers, extended sequence numbers |
//! | [RFC 4585](https://tools.ietf.org/html/rfc4585) | RTP feedback | Generic NACK parsing and packet retransmission |
//! | SMPTE ST 2110-20 | Uncompressed video transport | Packing modes, wire formats, packet counts |
//! | SMPTE ST 2110-21 | Traffic shaping | Narrow/wide profiles, epochs, TRO/TRS, VRX model |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ Application (producer / consumer)         │
//! ├───────────────────────────────────────────┤
//! │ session   — TX/RX state machines, polling │
//! │ frame     — formats, frames, slot ring    │
//! ├───────────────────────────────────────────┤
//! │ convert   — plugin registry + scalar table│
//! │ codec     — RFC 4175 packetize/reassemble │
//! │ pacing    — ST 2110-21 epochs and VRX     │
//! ├───────────────────────────────────────────┤
//! │ transport — NIC queue / PTP / DMA traits  │
//! │ rtcp      — optional NACK retransmission  │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use st2110::session::{NullTxEvents, VideoTx, VideoTxConfig};
//! use st2110::transport::loopback::LoopbackNic;
//! use st2110::transport::UptimeClock;
//!
//! let instance = st2110::instance::acquire();
//! let (nic_tx, _nic_rx) = LoopbackNic::pair();
//! let tx = VideoTx::new(
//!     instance,
//!     Arc::new(UptimeClock::new()),
//!     Box::new(nic_tx),
//!     Arc::new(NullTxEvents),
//!     VideoTxConfig::default(),
//! ).unwrap();
//! tx.start().unwrap();
//!
//! // producer: claim a slot, write pixels, hand it back
//! let mut frame = tx.get_frame(Duration::from_millis(10)).unwrap();
//! frame.frame.data.as_mut_slice().fill(0x10);
//! tx.put_frame(frame).unwrap();
//!
//! // worker: drive the pacer and the NIC
//! loop {
//!     match tx.poll() {
//!         st2110::session::PollStatus::Idle => break,
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Crate layout
//!
//! - [`session`] — [`VideoTx`]/[`VideoRx`] pipeline sessions, the
//!   [`MediaSession`] tagged boundary, timing parser.
//! - [`frame`] — [`PixelFormat`], [`Fps`], [`Frame`], and the slot ring.
//! - [`codec`] — RFC 4175 geometry, packetizer, depacketizer,
//!   auto-detection.
//! - [`convert`] — converter plugin registry and the built-in scalar
//!   kernels.
//! - [`pacing`] — ST 2110-21 pacer.
//! - [`transport`] — NIC queue, PTP clock, and DMA registration
//!   contracts, plus the in-memory loopback NIC.
//! - [`rtcp`] — RFC 4585 Generic NACK support.
//! - [`instance`] — refcounted process-wide registries.
//! - [`stats`] — session counters and the stable tracepoint surface.
//! - [`error`] — [`TransportError`] and the crate [`Result`] alias.

pub mod codec;
pub mod convert;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pacing;
pub mod rtcp;
pub mod session;
pub mod stats;
pub mod sync;
pub mod transport;

pub use error::{Result, TransportError};
pub use frame::{Fps, Frame, FrameStatus, PixelFormat, TransportFormat};
pub use session::{MediaSession, PollStatus, SessionEvent, SessionState, VideoRx, VideoTx};
pub use stats::SessionStats;
