//! DMA memory registration.
//!
//! Application buffers used on zero-copy paths must be visible to the NIC.
//! The registry maps virtual-address ranges to IO virtual addresses; it is
//! process-wide (one NIC init per process) but explicitly injectable so
//! tests can run their own instance.

use parking_lot::Mutex;

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy)]
struct Region {
    virt: usize,
    size: usize,
    iova: u64,
}

/// Registry of DMA-mapped regions keyed by virtual address range.
#[derive(Debug, Default)]
pub struct DmaRegistry {
    regions: Mutex<Vec<Region>>,
    next_iova: Mutex<u64>,
}

impl DmaRegistry {
    pub fn new() -> Self {
        DmaRegistry {
            regions: Mutex::new(Vec::new()),
            next_iova: Mutex::new(0x1000),
        }
    }

    /// Install a mapping for `[virt, virt + size)` and return its IOVA.
    ///
    /// Overlapping an existing registration is an error — double-mapping
    /// the same pages indicates a buffer lifetime bug in the caller.
    pub fn register(&self, virt: usize, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(TransportError::InvalidArgument("zero-size dma region".into()));
        }
        let mut regions = self.regions.lock();
        for r in regions.iter() {
            let overlap = virt < r.virt + r.size && r.virt < virt + size;
            if overlap {
                return Err(TransportError::InvalidArgument(format!(
                    "dma region {virt:#x}+{size:#x} overlaps {:#x}+{:#x}",
                    r.virt, r.size
                )));
            }
        }
        let mut next = self.next_iova.lock();
        let iova = *next;
        *next += size as u64;
        regions.push(Region { virt, size, iova });
        tracing::debug!(virt = format_args!("{virt:#x}"), size, iova, "dma region registered");
        Ok(iova)
    }

    /// Remove a mapping by its IOVA.
    pub fn unregister(&self, iova: u64) -> Result<()> {
        let mut regions = self.regions.lock();
        match regions.iter().position(|r| r.iova == iova) {
            Some(pos) => {
                let r = regions.swap_remove(pos);
                tracing::debug!(virt = format_args!("{:#x}", r.virt), iova, "dma region removed");
                Ok(())
            }
            None => Err(TransportError::InvalidArgument(format!(
                "unknown iova {iova:#x}"
            ))),
        }
    }

    /// Translate a virtual address inside a registered region.
    pub fn lookup(&self, virt: usize) -> Option<u64> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|r| virt >= r.virt && virt < r.virt + r.size)
            .map(|r| r.iova + (virt - r.virt) as u64)
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let reg = DmaRegistry::new();
        let iova = reg.register(0x10_0000, 0x1000).unwrap();
        assert_eq!(reg.lookup(0x10_0000), Some(iova));
        assert_eq!(reg.lookup(0x10_0800), Some(iova + 0x800));
        assert_eq!(reg.lookup(0x11_0000), None);
        reg.unregister(iova).unwrap();
        assert_eq!(reg.lookup(0x10_0000), None);
    }

    #[test]
    fn overlap_rejected() {
        let reg = DmaRegistry::new();
        reg.register(0x1000, 0x1000).unwrap();
        assert!(reg.register(0x1800, 0x1000).is_err());
        assert!(reg.register(0x0800, 0x1000).is_err());
        assert!(reg.register(0x2000, 0x1000).is_ok());
    }

    #[test]
    fn unknown_iova_rejected() {
        let reg = DmaRegistry::new();
        assert!(reg.unregister(42).is_err());
    }
}
