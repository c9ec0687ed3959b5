//! Function lifecycle controller.
//!
//! A function (PF or VF) moves through
//! `Uninitialized -> Realizing -> Active -> Exiting -> Destroyed`.
//! Kind-specific setup lives behind [`FunctionLifecycle::setup`]; every
//! resource it acquires is recorded as a [`TeardownStep`] so failed realizes
//! and normal exits share one teardown path.

pub mod physical;
pub mod virtual_fn;

pub use physical::PhysicalFunction;
pub use virtual_fn::VirtualFunction;

use crate::config::{FunctionConfig, MSIX_BAR};
use crate::error::{EduError, Result};
use crate::observability::metrics;
use crate::pci::{
    install_msix, remove_msix, CapabilityChain, ChainBuilder, ConfigSpace, SriovParams,
};
use crate::resources::{DeviceResources, RegionHandle, TableHandle};
use crate::rollback::RollbackStack;
use crate::types::{CapabilityId, FunctionId, FunctionIdentity, FunctionKind, LifecycleState};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Undo action recorded during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    ReleaseRegion(RegionHandle),
    ReleaseVectors(TableHandle),
    RemoveMsixCapability,
    TeardownChain,
    ClearVfTemplates,
}

/// State shared by both function kinds.
#[derive(Debug)]
pub struct FunctionCore {
    id: FunctionId,
    kind: FunctionKind,
    identity: FunctionIdentity,
    state: LifecycleState,
    pub(crate) settings: FunctionConfig,
    pub(crate) config_space: ConfigSpace,
    pub(crate) chain: CapabilityChain,
    pub(crate) bars: BTreeMap<u8, RegionHandle>,
    pub(crate) msix: Option<TableHandle>,
    pub(crate) teardown: RollbackStack<TeardownStep>,
}

impl FunctionCore {
    pub fn new(id: FunctionId, kind: FunctionKind, settings: FunctionConfig) -> Self {
        let identity = settings.identity();
        Self {
            id,
            kind,
            identity,
            state: LifecycleState::Uninitialized,
            config_space: ConfigSpace::new(id, &identity),
            settings,
            chain: CapabilityChain::new(),
            bars: BTreeMap::new(),
            msix: None,
            teardown: RollbackStack::new(),
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        debug!(function = %self.id, from = %self.state, to = %state, "Lifecycle transition");
        self.state = state;
    }

    /// Record a reserved BAR.
    pub(crate) fn hold_region(&mut self, slot: u8, handle: RegionHandle) {
        self.bars.insert(slot, handle);
        self.teardown.push(TeardownStep::ReleaseRegion(handle));
    }

    /// Record an initialized vector table.
    pub(crate) fn hold_vectors(&mut self, handle: TableHandle) {
        self.msix = Some(handle);
        self.teardown.push(TeardownStep::ReleaseVectors(handle));
    }

    /// Initialize the vector table in the MSI-X BAR, use every vector and
    /// advertise the table through the MSI-X capability.
    pub(crate) fn setup_msix(&mut self, resources: &mut DeviceResources) -> Result<()> {
        let table = resources.vectors.init_table(
            self.id,
            &resources.regions,
            self.settings.msix_vectors,
            MSIX_BAR,
            self.settings.msix_table_offset,
            self.settings.msix_pba_offset,
        )?;
        self.hold_vectors(table);
        resources.vectors.use_all(table)?;

        let layout =
            resources.vectors.table(table).ok_or(EduError::UnknownTable { handle: table.raw() })?;
        install_msix(&mut self.config_space, layout)?;
        self.teardown.push(TeardownStep::RemoveMsixCapability);
        Ok(())
    }

    /// Install the capability chain for this function's kind.
    pub(crate) fn setup_chain(&mut self, sriov: Option<&SriovParams>) -> Result<()> {
        self.teardown.push(TeardownStep::TeardownChain);
        let plan = CapabilityId::plan_for(self.kind);
        ChainBuilder::new(&mut self.config_space, &mut self.chain).install_all(plan, sriov)
    }

    /// Run every recorded undo step, newest first.
    fn run_teardown(&mut self, resources: &mut DeviceResources) {
        let Self { id, kind, config_space, chain, bars, msix, teardown, .. } = self;
        let plan = CapabilityId::plan_for(*kind);

        teardown.unwind(|step| match step {
            TeardownStep::TeardownChain => {
                ChainBuilder::new(&mut *config_space, &mut *chain).teardown(plan)
            }
            TeardownStep::RemoveMsixCapability => remove_msix(&mut *config_space),
            TeardownStep::ReleaseVectors(handle) => {
                resources.vectors.release_all(handle);
                *msix = None;
            }
            TeardownStep::ReleaseRegion(handle) => {
                resources.regions.release(handle);
                bars.retain(|_, held| *held != handle);
            }
            TeardownStep::ClearVfTemplates => resources.regions.clear_vf_bar_templates(*id),
        });
    }
}

/// Lifecycle contract shared by PFs and VFs.
pub trait FunctionLifecycle {
    fn core(&self) -> &FunctionCore;

    fn core_mut(&mut self) -> &mut FunctionCore;

    /// Reserve regions, vectors and capabilities.
    ///
    /// Implementations record an undo step for everything they acquire, before
    /// the next step runs, and return the first error unchanged.
    fn setup(&mut self, resources: &mut DeviceResources) -> Result<()>;

    fn id(&self) -> FunctionId {
        self.core().id
    }

    fn kind(&self) -> FunctionKind {
        self.core().kind
    }

    fn identity(&self) -> FunctionIdentity {
        self.core().identity
    }

    fn state(&self) -> LifecycleState {
        self.core().state
    }

    fn config_space(&self) -> &ConfigSpace {
        &self.core().config_space
    }

    fn chain(&self) -> &CapabilityChain {
        &self.core().chain
    }

    fn bar(&self, slot: u8) -> Option<RegionHandle> {
        self.core().bars.get(&slot).copied()
    }

    fn msix_table(&self) -> Option<TableHandle> {
        self.core().msix
    }

    /// Bring the function up.
    ///
    /// On failure the function has already been torn down and is `Destroyed`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Uninitialized`; otherwise the setup error.
    fn realize(&mut self, resources: &mut DeviceResources) -> Result<()> {
        let (id, kind, state) = (self.id(), self.kind(), self.state());
        if state != LifecycleState::Uninitialized {
            return Err(EduError::InvalidState {
                function: id,
                operation: "realize",
                state: state.to_string(),
            });
        }

        info!(function = %id, kind = %kind, type_name = kind.type_name(), "Realizing function");
        self.core_mut().set_state(LifecycleState::Realizing);

        match self.setup(resources) {
            Ok(()) => {
                self.core_mut().set_state(LifecycleState::Active);
                metrics::record_realized(kind);
                info!(function = %id, capabilities = ?self.chain().offsets(), "Function active");
                Ok(())
            }
            Err(e) => {
                warn!(function = %id, error = %e, "Realize failed, tearing down");
                metrics::record_realize_failure(kind, e.reason());
                let core = self.core_mut();
                core.set_state(LifecycleState::Exiting);
                core.run_teardown(resources);
                core.set_state(LifecycleState::Destroyed);
                Err(e)
            }
        }
    }

    /// Tear the function down. Never fails; a second call is a no-op.
    fn exit(&mut self, resources: &mut DeviceResources) {
        let (id, kind) = (self.id(), self.kind());
        let core = self.core_mut();
        match core.state {
            LifecycleState::Destroyed => {
                debug!(function = %id, "Function already destroyed");
            }
            LifecycleState::Uninitialized => core.set_state(LifecycleState::Destroyed),
            _ => {
                info!(function = %id, kind = %kind, "Exiting function");
                core.set_state(LifecycleState::Exiting);
                core.run_teardown(resources);
                core.set_state(LifecycleState::Destroyed);
                metrics::record_exited(kind);
            }
        }
    }

    /// Device-internal reset. Does not change the lifecycle state.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Active`.
    fn reset(&mut self) -> Result<()> {
        let (id, state) = (self.id(), self.state());
        if state != LifecycleState::Active {
            return Err(EduError::InvalidState {
                function: id,
                operation: "reset",
                state: state.to_string(),
            });
        }
        info!(function = %id, "Reset Template Device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EduConfig, MMIO_BAR};
    use crate::types::PF_CAPABILITIES;

    fn realized_pf(resources: &mut DeviceResources) -> PhysicalFunction {
        let mut pf = PhysicalFunction::new(&EduConfig::default());
        pf.realize(resources).unwrap();
        pf
    }

    #[test]
    fn test_pf_realize() {
        let mut resources = DeviceResources::default();
        let pf = realized_pf(&mut resources);

        assert_eq!(pf.state(), LifecycleState::Active);
        assert_eq!(pf.chain().offsets(), vec![0xa0, 0x100, 0x150, 0x140, 0x160]);
        assert_eq!(resources.vectors.vectors_in_use(pf.msix_table().unwrap()), vec![0, 1, 2, 3]);
        assert_eq!(resources.regions.regions_held(pf.id()), 2);
        assert_eq!(resources.regions.region_at(pf.id(), MMIO_BAR).unwrap().size, 0x8000_0000);
        assert_eq!(resources.regions.vf_bar_template(pf.id(), MMIO_BAR).unwrap().size, 4096);
        assert_eq!(pf.config_space().walk_standard(), vec![0xa0, 0x70]);
    }

    #[test]
    fn test_exit_releases_everything() {
        let mut resources = DeviceResources::default();
        let mut pf = realized_pf(&mut resources);

        pf.exit(&mut resources);
        pf.exit(&mut resources);

        assert_eq!(pf.state(), LifecycleState::Destroyed);
        assert_eq!(resources.regions.total_held(), 0);
        assert_eq!(resources.vectors.total_in_use(), 0);
        assert_eq!(resources.vectors.table_count(), 0);
        assert!(resources.regions.vf_bar_templates(pf.id()).is_empty());
        assert!(pf.chain().is_empty());
        assert!(pf.config_space().claims().is_empty());
        assert!(pf.bar(MMIO_BAR).is_none());
    }

    #[test]
    fn test_realize_failure_tears_down() {
        let mut resources = DeviceResources::default();
        let mut pf = PhysicalFunction::new(&EduConfig::default());
        // Occupy part of the AER block so the chain fails after Express
        pf.core_mut().config_space.claim(CapabilityId::Ats, 0x110, 0x08).unwrap();

        let err = pf.realize(&mut resources).unwrap_err();

        assert!(matches!(err, EduError::SlotConflict { .. }));
        assert_eq!(pf.state(), LifecycleState::Destroyed);
        assert_eq!(resources.regions.total_held(), 0);
        assert_eq!(resources.vectors.total_in_use(), 0);
        assert!(pf.chain().is_empty());
        assert!(pf.config_space().walk_standard().is_empty());
    }

    #[test]
    fn test_vector_budget_failure_tears_down() {
        let mut resources = DeviceResources {
            vectors: crate::resources::VectorManager::with_budget(3),
            ..Default::default()
        };
        let mut pf = PhysicalFunction::new(&EduConfig::default());

        let err = pf.realize(&mut resources).unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(pf.state(), LifecycleState::Destroyed);
        assert_eq!(resources.regions.total_held(), 0);
        assert_eq!(resources.vectors.table_count(), 0);
    }

    #[test]
    fn test_vf_requires_pf_templates() {
        let mut resources = DeviceResources::default();
        let config = EduConfig::default();
        let mut vf =
            VirtualFunction::new(FunctionId::new(0x80), FunctionId::new(0), 0, config.vf.clone());

        let err = vf.realize(&mut resources).unwrap_err();
        assert!(matches!(err, EduError::BarMissing { slot: 0, .. }));
        assert_eq!(vf.state(), LifecycleState::Destroyed);
    }

    #[test]
    fn test_vf_realize_from_templates() {
        let mut resources = DeviceResources::default();
        let pf = realized_pf(&mut resources);
        let config = EduConfig::default();
        let mut vf = VirtualFunction::new(FunctionId::new(0x80), pf.id(), 0, config.vf.clone());

        vf.realize(&mut resources).unwrap();

        assert_eq!(vf.physfn(), pf.id());
        assert_eq!(vf.chain().offsets(), vec![0xa0, 0x100, 0x150]);
        assert_eq!(resources.regions.region_at(vf.id(), MMIO_BAR).unwrap().size, 4096);
        assert_eq!(resources.vectors.vectors_in_use(vf.msix_table().unwrap()), vec![0, 1]);
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut resources = DeviceResources::default();
        let mut pf = PhysicalFunction::new(&EduConfig::default());

        assert!(matches!(pf.reset(), Err(EduError::InvalidState { operation: "reset", .. })));

        pf.realize(&mut resources).unwrap();
        assert!(pf.reset().is_ok());
        assert_eq!(pf.state(), LifecycleState::Active);
        assert!(matches!(pf.realize(&mut resources), Err(EduError::InvalidState { .. })));

        pf.exit(&mut resources);
        assert!(pf.reset().is_err());
        assert!(pf.realize(&mut resources).is_err());
    }

    #[test]
    fn test_teardown_plan_is_reverse_of_setup() {
        let mut resources = DeviceResources::default();
        let pf = realized_pf(&mut resources);

        let steps = pf.core().teardown.pending();
        assert!(matches!(steps[0], TeardownStep::ReleaseRegion(_)));
        assert!(matches!(steps[2], TeardownStep::ReleaseVectors(_)));
        assert_eq!(
            &steps[3..],
            &[
                TeardownStep::RemoveMsixCapability,
                TeardownStep::TeardownChain,
                TeardownStep::ClearVfTemplates,
            ]
        );
        assert_eq!(PF_CAPABILITIES.len(), pf.chain().len());
    }
}
