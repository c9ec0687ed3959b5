//! Physical function.

use super::{FunctionCore, FunctionLifecycle, TeardownStep};
use crate::config::{EduConfig, MMIO_BAR, MSIX_BAR};
use crate::error::Result;
use crate::pci::{clear_vf_enable, set_vf_enable, write_vf_bar, write_vf_routing, SriovParams};
use crate::resources::{DeviceResources, RegionKind, VfBarTemplate};
use crate::types::{FunctionId, FunctionKind};
use tracing::{debug, info};

/// The always-present function of the device.
///
/// Reserves its own BARs directly and declares the per-VF BAR templates its
/// virtual functions are sized from.
#[derive(Debug)]
pub struct PhysicalFunction {
    core: FunctionCore,
    sriov: SriovParams,
    vf_bars: Vec<VfBarTemplate>,
    num_vfs: u16,
}

impl PhysicalFunction {
    pub fn new(config: &EduConfig) -> Self {
        let id = FunctionId::new(config.sriov.pf_routing_id);
        Self {
            core: FunctionCore::new(id, FunctionKind::Pf, config.pf.clone()),
            sriov: SriovParams {
                total_vfs: config.sriov.total_vfs,
                initial_vfs: config.sriov.initial_vfs,
                vf_offset: config.sriov.vf_offset,
                vf_stride: config.sriov.vf_stride,
                vf_device_id: config.vf.device_id,
            },
            vf_bars: vec![
                VfBarTemplate { slot: MMIO_BAR, size: config.vf.mmio_bar_size, is_64bit: true },
                VfBarTemplate { slot: MSIX_BAR, size: config.vf.msix_bar_size, is_64bit: false },
            ],
            num_vfs: 0,
        }
    }

    pub fn sriov_params(&self) -> &SriovParams {
        &self.sriov
    }

    /// VFs currently enabled.
    pub fn num_vfs(&self) -> u16 {
        self.num_vfs
    }

    /// Reflect an SR-IOV enable in the capability registers.
    pub(crate) fn enable_vfs(
        &mut self,
        num_vfs: u16,
        vf_device_id: u16,
        vf_offset: u16,
        vf_stride: u16,
    ) {
        let config = &mut self.core.config_space;
        write_vf_routing(config, vf_offset, vf_stride, vf_device_id);
        set_vf_enable(config, num_vfs);
        self.num_vfs = num_vfs;
        debug!(function = %self.core.id, num_vfs, "VF Enable set");
    }

    /// Reflect an SR-IOV disable in the capability registers.
    pub(crate) fn disable_vfs(&mut self) {
        clear_vf_enable(&mut self.core.config_space);
        write_vf_routing(
            &mut self.core.config_space,
            self.sriov.vf_offset,
            self.sriov.vf_stride,
            self.sriov.vf_device_id,
        );
        self.num_vfs = 0;
        debug!(function = %self.core.id, "VF Enable cleared");
    }
}

impl FunctionLifecycle for PhysicalFunction {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn setup(&mut self, resources: &mut DeviceResources) -> Result<()> {
        let id = self.core.id;
        let mmio_size = self.core.settings.mmio_bar_size;
        let msix_size = self.core.settings.msix_bar_size;

        let bar = resources.regions.reserve(id, MMIO_BAR, mmio_size, true, RegionKind::Mmio)?;
        self.core.hold_region(MMIO_BAR, bar);
        let bar =
            resources.regions.reserve(id, MSIX_BAR, msix_size, false, RegionKind::MsixWindow)?;
        self.core.hold_region(MSIX_BAR, bar);

        self.core.setup_msix(resources)?;
        self.core.setup_chain(Some(&self.sriov))?;

        self.core.teardown.push(TeardownStep::ClearVfTemplates);
        for template in &self.vf_bars {
            resources.regions.declare_vf_bar_template(
                id,
                template.slot,
                template.size,
                template.is_64bit,
            )?;
            write_vf_bar(&mut self.core.config_space, template);
        }

        info!(
            function = %id,
            total_vfs = self.sriov.total_vfs,
            vf_offset = self.sriov.vf_offset,
            vf_stride = self.sriov.vf_stride,
            "SR-IOV capable"
        );
        Ok(())
    }
}
