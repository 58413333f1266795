//! Pixel-format converter selection: external plugins and the built-in
//! scalar fallback.
//!
//! A media session that is not in derive mode needs a converter between its
//! surface format and the wire format. External converters (CPU/GPU/FPGA)
//! register with the process-wide [`ConverterRegistry`]; the registry walks
//! registrations in insertion order and the first plugin whose `probe`
//! accepts the request wins. When no plugin matches — or the request pins
//! [`Device::TestInternal`] — the built-in scalar table serves the session.
//! Selection is immutable for the session lifetime.
//!
//! A plugin-backed converter runs on its own worker: the media session
//! edge-triggers [`ConverterSession::notify_frame_ready`], the worker pulls
//! work through its [`ConvertSource`] and pushes results back with
//! `put_frame`. The built-in fallback instead runs inline in the producer's
//! `put_frame` call.

pub mod internal;

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{Result, TransportError};
use crate::frame::{Fps, Frame, PixelFormat};
pub use internal::ConvertFn;

/// Conversion device preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// First matching plugin, else the built-in table.
    #[default]
    Auto,
    Cpu,
    Gpu,
    Fpga,
    /// Force the built-in scalar table (test and bring-up paths).
    TestInternal,
}

/// Everything a converter needs to decide whether it can serve a session.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub input: PixelFormat,
    pub output: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub interlaced: bool,
    pub framebuff_cnt: usize,
    pub device: Device,
}

/// One unit of conversion work pulled from a media session.
#[derive(Debug)]
pub struct ConvertTask {
    pub slot: usize,
    pub src: Frame,
    pub dst: Frame,
}

/// The media-session side of the converter frame pump.
///
/// `get_frame` claims the oldest Ready slot and loans both frames;
/// `put_frame` returns them with the outcome. On failure the slot recycles
/// to Free and the session's convert-fail counter increments.
pub trait ConvertSource: Send + Sync {
    fn get_frame(&self) -> Option<ConvertTask>;
    fn put_frame(&self, task: ConvertTask, result: Result<()>);
}

/// An active converter bound to one media session.
///
/// Must tolerate concurrent sessions of the same plugin; calls within one
/// session are never concurrent.
pub trait ConverterSession: Send + Sync {
    /// Edge-trigger: at least one frame is Ready. The converter pulls via
    /// its [`ConvertSource`] until `get_frame` returns `None`.
    fn notify_frame_ready(&self);

    /// Periodic stat hook; default is silent.
    fn dump_stats(&self) {}
}

/// A registered external converter factory.
pub trait ConverterPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn device(&self) -> Device;
    /// Whether this plugin can serve the request.
    fn probe(&self, req: &ConvertRequest) -> bool;
    /// Build a session bound to `source`.
    fn create(
        &self,
        req: &ConvertRequest,
        source: Arc<dyn ConvertSource>,
    ) -> Result<Arc<dyn ConverterSession>>;
}

/// Outcome of converter selection for one session.
pub enum Selection {
    /// Serve via a registered plugin.
    Plugin(Arc<dyn ConverterPlugin>),
    /// Serve inline via the built-in scalar kernel.
    Internal(ConvertFn),
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Plugin(p) => write!(f, "Plugin({})", p.name()),
            Selection::Internal(_) => write!(f, "Internal"),
        }
    }
}

/// Process-wide converter plugin registry.
///
/// Also tracks weak back-references to the converter sessions currently
/// active, so a periodic stat pass can reach them without owning them; a
/// media session drops its strong reference at destroy and the weak entry
/// goes dead with it.
#[derive(Default)]
pub struct ConverterRegistry {
    plugins: RwLock<Vec<Arc<dyn ConverterPlugin>>>,
    active: RwLock<Vec<(u64, Weak<dyn ConverterSession>)>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin; insertion order is selection order.
    pub fn register(&self, plugin: Arc<dyn ConverterPlugin>) {
        tracing::info!(name = plugin.name(), device = ?plugin.device(), "converter registered");
        self.plugins.write().push(plugin);
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.read().len()
    }

    /// Choose a converter for the request.
    ///
    /// Walks plugins in insertion order unless the request pins
    /// `TestInternal`; falls back to the built-in table; fails with
    /// `UnsupportedFormat` when neither can serve the pair.
    pub fn select(&self, req: &ConvertRequest) -> Result<Selection> {
        if req.device != Device::TestInternal {
            let plugins = self.plugins.read();
            for plugin in plugins.iter() {
                let device_ok = matches!(req.device, Device::Auto) || plugin.device() == req.device;
                if device_ok && plugin.probe(req) {
                    tracing::debug!(name = plugin.name(), "converter selected");
                    return Ok(Selection::Plugin(plugin.clone()));
                }
            }
        }
        match internal::get_converter(req.input, req.output) {
            Some(f) => {
                tracing::debug!(
                    input = req.input.name(),
                    output = req.output.name(),
                    "internal converter selected"
                );
                Ok(Selection::Internal(f))
            }
            None => Err(TransportError::UnsupportedFormat(format!(
                "{} -> {}",
                req.input.name(),
                req.output.name()
            ))),
        }
    }

    /// Track an active converter session under its media session id.
    pub fn attach(&self, session_id: u64, session: &Arc<dyn ConverterSession>) {
        self.active
            .write()
            .push((session_id, Arc::downgrade(session)));
    }

    /// Drop the back-reference for a destroyed media session.
    pub fn detach(&self, session_id: u64) {
        self.active.write().retain(|(id, _)| *id != session_id);
    }

    /// Run the periodic stat hook on every live converter session.
    pub fn dump_stats(&self) {
        let mut active = self.active.write();
        active.retain(|(_, weak)| match weak.upgrade() {
            Some(session) => {
                session.dump_stats();
                true
            }
            None => false,
        });
    }

    /// Live converter-session count (dead weak entries excluded).
    pub fn active_count(&self) -> usize {
        self.active
            .read()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }
}
