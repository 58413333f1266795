//! Process-wide shared state.
//!
//! Hosting libraries (FFmpeg/GStreamer plugins, language bindings) may
//! open many sessions from one process, but the NIC and the converter
//! plugin table are initialized once. [`acquire`]/[`release`] refcount a
//! lazily created [`Instance`]; sessions take an `Arc<Instance>` so tests
//! can inject a private one instead of the global.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::convert::ConverterRegistry;
use crate::transport::DmaRegistry;

/// Shared per-process registries.
#[derive(Default)]
pub struct Instance {
    pub converters: ConverterRegistry,
    pub dma: DmaRegistry,
    next_session_id: Mutex<u64>,
}

impl Instance {
    pub fn new() -> Arc<Self> {
        Arc::new(Instance::default())
    }

    /// Unique id for a new media session.
    pub fn next_session_id(&self) -> u64 {
        let mut id = self.next_session_id.lock();
        let v = *id;
        *id += 1;
        v
    }
}

static SHARED: Mutex<Option<(Arc<Instance>, usize)>> = Mutex::new(None);

/// Take a reference on the process-wide instance, creating it on first use.
pub fn acquire() -> Arc<Instance> {
    let mut shared = SHARED.lock();
    match shared.as_mut() {
        Some((inst, count)) => {
            *count += 1;
            inst.clone()
        }
        None => {
            let inst = Instance::new();
            *shared = Some((inst.clone(), 1));
            tracing::info!("shared instance created");
            inst
        }
    }
}

/// Drop one reference; the instance is torn down when the last holder
/// releases it.
pub fn release() {
    let mut shared = SHARED.lock();
    if let Some((_, count)) = shared.as_mut() {
        *count -= 1;
        if *count == 0 {
            *shared = None;
            tracing::info!("shared instance released");
        }
    }
}

/// Current refcount, for host bindings that need to know whether they own
/// the final release.
pub fn ref_count() -> usize {
    SHARED.lock().as_ref().map(|(_, c)| *c).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let inst = Instance::new();
        let a = inst.next_session_id();
        let b = inst.next_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn acquire_release_refcounts() {
        // serialize against other tests touching the global
        let first = acquire();
        let base = ref_count();
        let second = acquire();
        assert_eq!(ref_count(), base + 1);
        assert!(Arc::ptr_eq(&first, &second));
        release();
        assert_eq!(ref_count(), base);
        release();
        drop((first, second));
    }

    #[test]
    fn injectable_instance_is_independent() {
        let a = Instance::new();
        let b = Instance::new();
        a.converters
            .register(std::sync::Arc::new(NopPlugin));
        assert_eq!(a.converters.plugin_count(), 1);
        assert_eq!(b.converters.plugin_count(), 0);
    }

    struct NopPlugin;
    impl crate::convert::ConverterPlugin for NopPlugin {
        fn name(&self) -> &str {
            "nop"
        }
        fn device(&self) -> crate::convert::Device {
            crate::convert::Device::Cpu
        }
        fn probe(&self, _req: &crate::convert::ConvertRequest) -> bool {
            false
        }
        fn create(
            &self,
            _req: &crate::convert::ConvertRequest,
            _source: std::sync::Arc<dyn crate::convert::ConvertSource>,
        ) -> crate::error::Result<std::sync::Arc<dyn crate::convert::ConverterSession>> {
            Err(crate::error::TransportError::ConvertFail)
        }
    }
}
