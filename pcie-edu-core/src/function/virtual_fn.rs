//! Virtual function.

use super::{FunctionCore, FunctionLifecycle};
use crate::config::{FunctionConfig, MMIO_BAR, MSIX_BAR};
use crate::error::Result;
use crate::resources::{DeviceResources, RegionKind};
use crate::types::{FunctionId, FunctionKind};

/// A function spawned by SR-IOV enable.
///
/// BAR sizes come from the templates its physical function declared, never
/// from its own configuration.
#[derive(Debug)]
pub struct VirtualFunction {
    core: FunctionCore,
    physfn: FunctionId,
    index: u16,
}

impl VirtualFunction {
    pub fn new(id: FunctionId, physfn: FunctionId, index: u16, settings: FunctionConfig) -> Self {
        Self { core: FunctionCore::new(id, FunctionKind::Vf, settings), physfn, index }
    }

    /// The owning physical function.
    pub fn physfn(&self) -> FunctionId {
        self.physfn
    }

    /// Position of this VF within its PF's VF set.
    pub fn index(&self) -> u16 {
        self.index
    }
}

impl FunctionLifecycle for VirtualFunction {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn setup(&mut self, resources: &mut DeviceResources) -> Result<()> {
        let id = self.core.id;

        let bar = resources.regions.reserve_vf_bar(id, self.physfn, MMIO_BAR, RegionKind::Mmio)?;
        self.core.hold_region(MMIO_BAR, bar);
        let bar =
            resources.regions.reserve_vf_bar(id, self.physfn, MSIX_BAR, RegionKind::MsixWindow)?;
        self.core.hold_region(MSIX_BAR, bar);

        self.core.setup_msix(resources)?;
        self.core.setup_chain(None)
    }
}
