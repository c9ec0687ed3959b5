//! Device-wide resources shared by the PF and its VFs.
//!
//! Both allocators are owned by the SR-IOV supervisor and lent to one
//! function's lifecycle controller at a time.

pub mod msix;
pub mod region;

pub use msix::{TableHandle, VectorManager, VectorTable, MSIX_MAX_VECTORS};
pub use region::{MemoryRegion, RegionHandle, RegionKind, RegionRegistry, VfBarTemplate};

use crate::host::AddressSpace;

/// Region registry and vector manager of one device.
#[derive(Debug, Default)]
pub struct DeviceResources {
    pub regions: RegionRegistry,
    pub vectors: VectorManager,
}

impl DeviceResources {
    pub fn new(address_space: Box<dyn AddressSpace>, vector_budget: Option<u32>) -> Self {
        Self {
            regions: RegionRegistry::with_address_space(address_space),
            vectors: match vector_budget {
                Some(budget) => VectorManager::with_budget(budget),
                None => VectorManager::new(),
            },
        }
    }
}
