//! SR-IOV supervisor.
//!
//! Owns the physical function, the VFs spawned from it and the device-wide
//! resources they share. This is the surface the host drives: realize, exit
//! and reset callbacks, SR-IOV enable/disable, and MMIO dispatch.

use crate::config::{EduConfig, MMIO_BAR};
use crate::error::{EduError, Result};
use crate::function::{FunctionLifecycle, PhysicalFunction, VirtualFunction};
use crate::host::{AddressSpace, MmioHandler, TracingAddressSpace, TracingMmio};
use crate::observability::metrics;
use crate::resources::DeviceResources;
use crate::types::{FunctionId, LifecycleState};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

/// Observable resource counts of the whole device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub regions_held: usize,
    pub vectors_in_use: u32,
    pub capability_count: usize,
    pub vf_count: usize,
    pub sriov_enabled: bool,
}

/// Owner of the PF and its VFs.
pub struct SriovSupervisor {
    config: EduConfig,
    resources: DeviceResources,
    pf: PhysicalFunction,
    vfs: Vec<VirtualFunction>,
    sriov_enabled: bool,
    mmio: Box<dyn MmioHandler>,
}

impl SriovSupervisor {
    /// Supervisor with logging-only host collaborators.
    pub fn new(config: EduConfig) -> Result<Self> {
        Self::with_host(config, Box::new(TracingAddressSpace), Box::new(TracingMmio))
    }

    /// Supervisor wired to the host's address space and data plane.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation.
    pub fn with_host(
        config: EduConfig,
        address_space: Box<dyn AddressSpace>,
        mmio: Box<dyn MmioHandler>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            vendor_id = format_args!("{:#06x}", config.pf.vendor_id),
            device_id = format_args!("{:#06x}", config.pf.device_id),
            total_vfs = config.sriov.total_vfs,
            "Creating SR-IOV device"
        );

        Ok(Self {
            resources: DeviceResources::new(address_space, config.msix_vector_budget),
            pf: PhysicalFunction::new(&config),
            vfs: Vec::new(),
            sriov_enabled: false,
            mmio,
            config,
        })
    }

    /// Host realize callback: bring up the PF.
    ///
    /// A PF destroyed by an earlier exit or failed realize is replaced by a
    /// fresh instance first.
    #[instrument(skip(self))]
    pub fn realize(&mut self) -> Result<()> {
        if self.pf.state() == LifecycleState::Destroyed {
            debug!("Replacing destroyed physical function");
            self.pf = PhysicalFunction::new(&self.config);
        }

        if let Err(e) = self.pf.realize(&mut self.resources) {
            error!(error = %e, "Physical function realize failed");
            return Err(e);
        }
        Ok(())
    }

    /// Host exit callback: disable SR-IOV, then tear down the PF. Never fails.
    #[instrument(skip(self))]
    pub fn exit(&mut self) {
        self.disable_sriov();
        self.pf.exit(&mut self.resources);
        info!(regions_held = self.resources.regions.total_held(), "Device exited");
    }

    /// Host reset callback for `function`.
    ///
    /// # Errors
    ///
    /// `InvalidAccess` for an unknown function, `InvalidState` if it is not active.
    pub fn reset(&mut self, function: FunctionId) -> Result<()> {
        if function == self.pf.id() {
            return self.pf.reset();
        }
        self.vfs
            .iter_mut()
            .find(|vf| vf.id() == function)
            .ok_or_else(|| EduError::InvalidAccess {
                function,
                reason: "no such function".to_string(),
            })?
            .reset()
    }

    /// Spawn `vf_count` VFs.
    ///
    /// VFs are realized in index order. If one fails, those already realized
    /// exit in reverse order and SR-IOV stays disabled.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the PF is not active or SR-IOV is already enabled
    /// - `InvalidConfig` for a zero count or zero stride with more than one VF
    /// - `ResourceExhausted` if `vf_count` exceeds TotalVFs or routing ids overflow
    /// - the first VF realize error
    #[instrument(skip(self), fields(pf = %self.pf.id()))]
    pub fn enable_sriov(
        &mut self,
        vf_count: u16,
        vf_device_id: u16,
        routing_offset: u16,
        routing_stride: u16,
    ) -> Result<()> {
        let pf_id = self.pf.id();
        let state = self.pf.state();
        if state != LifecycleState::Active {
            return Err(EduError::InvalidState {
                function: pf_id,
                operation: "enable SR-IOV",
                state: state.to_string(),
            });
        }
        if self.sriov_enabled {
            return Err(EduError::InvalidState {
                function: pf_id,
                operation: "enable SR-IOV",
                state: "SR-IOV enabled".to_string(),
            });
        }
        if vf_count == 0 {
            return Err(EduError::InvalidConfig {
                reason: "vf_count must be at least 1".to_string(),
            });
        }
        let total_vfs = self.pf.sriov_params().total_vfs;
        if vf_count > total_vfs {
            return Err(EduError::ResourceExhausted {
                resource: "vfs",
                requested: u64::from(vf_count),
                limit: u64::from(total_vfs),
            });
        }
        if routing_stride == 0 && vf_count > 1 {
            return Err(EduError::InvalidConfig {
                reason: "routing_stride must be non-zero".to_string(),
            });
        }

        let mut settings = self.config.vf.clone();
        settings.device_id = vf_device_id;

        let mut realized: Vec<VirtualFunction> = Vec::with_capacity(usize::from(vf_count));
        for index in 0..vf_count {
            let outcome = FunctionId::vf_routing_id(pf_id, routing_offset, routing_stride, index)
                .ok_or_else(|| EduError::ResourceExhausted {
                    resource: "vf routing ids",
                    requested: u64::from(pf_id.routing_id())
                        + u64::from(routing_offset)
                        + u64::from(routing_stride) * u64::from(index),
                    limit: u64::from(u16::MAX),
                })
                .and_then(|vf_id| {
                    let mut vf = VirtualFunction::new(vf_id, pf_id, index, settings.clone());
                    vf.realize(&mut self.resources).map(|()| vf)
                });

            match outcome {
                Ok(vf) => realized.push(vf),
                Err(e) => {
                    warn!(
                        index,
                        error = %e,
                        rollback = realized.len(),
                        "VF realize failed, rolling back"
                    );
                    for vf in realized.iter_mut().rev() {
                        vf.exit(&mut self.resources);
                    }
                    metrics::record_sriov_enable("failure");
                    return Err(e);
                }
            }
        }

        self.pf.enable_vfs(vf_count, vf_device_id, routing_offset, routing_stride);
        self.vfs = realized;
        self.sriov_enabled = true;
        metrics::record_sriov_enable("success");
        metrics::set_vf_count(self.vfs.len());
        info!(vf_count, "SR-IOV enabled");
        Ok(())
    }

    /// Tear down every VF, last first. Best effort; never fails.
    #[instrument(skip(self), fields(pf = %self.pf.id()))]
    pub fn disable_sriov(&mut self) {
        if !self.sriov_enabled {
            debug!("SR-IOV not enabled");
            return;
        }

        while let Some(mut vf) = self.vfs.pop() {
            vf.exit(&mut self.resources);
        }
        self.pf.disable_vfs();
        self.sriov_enabled = false;
        metrics::set_vf_count(0);
        info!("SR-IOV disabled");
    }

    /// Dispatch an MMIO read to the data plane.
    ///
    /// # Errors
    ///
    /// `InvalidAccess` for a bad size, range or function; `InvalidState` if
    /// the function is not active.
    pub fn mmio_read(&mut self, function: FunctionId, offset: u64, size: u8) -> Result<u64> {
        self.check_access(function, offset, size)?;
        Ok(self.mmio.read(function, offset, size))
    }

    /// Dispatch an MMIO write to the data plane.
    pub fn mmio_write(
        &mut self,
        function: FunctionId,
        offset: u64,
        value: u64,
        size: u8,
    ) -> Result<()> {
        self.check_access(function, offset, size)?;
        self.mmio.write(function, offset, value, size);
        Ok(())
    }

    fn check_access(&self, function: FunctionId, offset: u64, size: u8) -> Result<()> {
        if size != 4 && size != 8 {
            return Err(EduError::InvalidAccess {
                function,
                reason: format!("access size {} not 4 or 8", size),
            });
        }

        let state = self.function_state(function).ok_or_else(|| EduError::InvalidAccess {
            function,
            reason: "no such function".to_string(),
        })?;
        if state != LifecycleState::Active {
            return Err(EduError::InvalidState {
                function,
                operation: "access MMIO",
                state: state.to_string(),
            });
        }

        let bar = self.resources.regions.region_at(function, MMIO_BAR).ok_or(EduError::BarMissing {
            function,
            slot: MMIO_BAR,
        })?;
        match offset.checked_add(u64::from(size)) {
            Some(end) if end <= bar.size => Ok(()),
            _ => Err(EduError::InvalidAccess {
                function,
                reason: format!(
                    "offset {:#x} outside BAR {} ({:#x} bytes)",
                    offset, MMIO_BAR, bar.size
                ),
            }),
        }
    }

    fn function_state(&self, function: FunctionId) -> Option<LifecycleState> {
        if function == self.pf.id() {
            return Some(self.pf.state());
        }
        self.vf_by_id(function).map(|vf| vf.state())
    }

    fn vf_by_id(&self, function: FunctionId) -> Option<&VirtualFunction> {
        self.vfs.iter().find(|vf| vf.id() == function)
    }

    pub fn pf(&self) -> &PhysicalFunction {
        &self.pf
    }

    pub fn vfs(&self) -> &[VirtualFunction] {
        &self.vfs
    }

    pub fn vf(&self, index: usize) -> Option<&VirtualFunction> {
        self.vfs.get(index)
    }

    pub fn sriov_enabled(&self) -> bool {
        self.sriov_enabled
    }

    pub fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    /// Resource counts across the PF and every VF.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let capability_count = self.pf.config_space().claims().len()
            + self.vfs.iter().map(|vf| vf.config_space().claims().len()).sum::<usize>();
        DeviceSnapshot {
            regions_held: self.resources.regions.total_held(),
            vectors_in_use: self.resources.vectors.total_in_use(),
            capability_count,
            vf_count: self.vfs.len(),
            sriov_enabled: self.sriov_enabled,
        }
    }
}

impl std::fmt::Debug for SriovSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SriovSupervisor")
            .field("pf", &self.pf.id())
            .field("pf_state", &self.pf.state())
            .field("vfs", &self.vfs.len())
            .field("sriov_enabled", &self.sriov_enabled)
            .finish()
    }
}
