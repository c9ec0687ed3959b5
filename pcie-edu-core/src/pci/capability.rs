//! Capability chain construction and teardown.
//!
//! Capabilities are installed at fixed offsets in a fixed order. Every step
//! that succeeds pushes its own uninstall onto a rollback stack; a failing
//! step unwinds the stack so no partial chain survives. Teardown walks the
//! plan backwards and is a no-op for anything never installed.

use super::config_space::{ConfigSpace, PCI_CONFIG_SPACE_SIZE};
use crate::error::{EduError, Result};
use crate::resources::{VectorTable, VfBarTemplate};
use crate::rollback::RollbackStack;
use crate::types::{CapabilityId, CapabilityRecord, FunctionId, PF_CAPABILITIES};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

// Express capability registers
const PCI_EXP_FLAGS: u16 = 0x02;
const PCI_EXP_DEVCAP: u16 = 0x04;
const PCI_EXP_LNKCAP: u16 = 0x0c;
const PCI_EXP_LNKSTA: u16 = 0x12;
/// Capability version 2, device/port type 0 (endpoint).
const PCI_EXP_FLAGS_ENDPOINT_V2: u16 = 0x0002;
const PCI_EXP_DEVCAP_RBER: u32 = 0x8000;
/// 2.5 GT/s, x1.
const PCI_EXP_LNK_GEN1_X1: u16 = 0x0011;

// AER
const PCI_ERR_UNCOR_SEVER: u16 = 0x0c;
const PCI_ERR_UNC_SEVERITY_DEFAULT: u32 = 0x0046_2030;

// ARI
const PCI_ARI_CAP: u16 = 0x04;

// ATS
const PCI_ATS_CAP: u16 = 0x04;
const PCI_ATS_CAP_PAGE_ALIGNED: u16 = 0x0020;

// MSI-X
const PCI_MSIX_FLAGS: u16 = 0x02;
const PCI_MSIX_TABLE: u16 = 0x04;
const PCI_MSIX_PBA: u16 = 0x08;
const PCI_MSIX_FLAGS_QSIZE: u16 = 0x07ff;

// SR-IOV
pub const PCI_SRIOV_CTRL: u16 = 0x08;
pub const PCI_SRIOV_INITIAL_VF: u16 = 0x0c;
pub const PCI_SRIOV_TOTAL_VF: u16 = 0x0e;
pub const PCI_SRIOV_NUM_VF: u16 = 0x10;
pub const PCI_SRIOV_VF_OFFSET: u16 = 0x14;
pub const PCI_SRIOV_VF_STRIDE: u16 = 0x16;
pub const PCI_SRIOV_VF_DID: u16 = 0x1a;
pub const PCI_SRIOV_SUP_PGSIZE: u16 = 0x1c;
pub const PCI_SRIOV_SYS_PGSIZE: u16 = 0x20;
pub const PCI_SRIOV_BAR: u16 = 0x24;
pub const PCI_SRIOV_CTRL_VFE: u16 = 0x0001;
pub const PCI_SRIOV_CTRL_MSE: u16 = 0x0008;
const PCI_SRIOV_SUP_PGSIZE_DEFAULT: u32 = 0x553;
const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x04;

/// Parameters written into the SR-IOV capability of a PF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SriovParams {
    pub total_vfs: u16,
    pub initial_vfs: u16,
    pub vf_offset: u16,
    pub vf_stride: u16,
    pub vf_device_id: u16,
}

/// Installed capabilities of one function, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityChain {
    records: Vec<CapabilityRecord>,
}

impl CapabilityChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[CapabilityRecord] {
        &self.records
    }

    /// Offsets in plan order.
    pub fn offsets(&self) -> Vec<u16> {
        self.records.iter().map(|r| r.offset).collect()
    }

    pub fn get(&self, id: CapabilityId) -> Option<&CapabilityRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn link(&mut self, id: CapabilityId) {
        let pos = self.records.iter().position(|r| plan_rank(r.id) > plan_rank(id));
        let pos = pos.unwrap_or(self.records.len());
        let record = CapabilityRecord {
            id,
            offset: id.offset(),
            size: id.size(),
            prev: None,
            next: None,
        };
        self.records.insert(pos, record);
        self.relink();
    }

    fn unlink(&mut self, id: CapabilityId) -> Option<CapabilityRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        let record = self.records.remove(pos);
        self.relink();
        Some(record)
    }

    fn relink(&mut self) {
        let offsets = self.offsets();
        for (i, record) in self.records.iter_mut().enumerate() {
            record.prev = i.checked_sub(1).map(|p| offsets[p]);
            record.next = offsets.get(i + 1).copied();
        }
    }

    /// Installed extended capability that must stay ahead of `id` in the
    /// 0x100 list but would end up behind it.
    fn extended_successor(&self, id: CapabilityId) -> Option<CapabilityId> {
        if !id.is_extended() || id.offset() == PCI_CONFIG_SPACE_SIZE {
            return None;
        }
        self.records
            .iter()
            .find(|r| r.id.is_extended() && plan_rank(r.id) > plan_rank(id))
            .map(|r| r.id)
    }
}

/// Position of `id` in the full PF install plan.
fn plan_rank(id: CapabilityId) -> usize {
    PF_CAPABILITIES.iter().position(|&c| c == id).unwrap_or(PF_CAPABILITIES.len())
}

/// Installs and removes capabilities of one function.
pub struct ChainBuilder<'a> {
    function: FunctionId,
    config: &'a mut ConfigSpace,
    chain: &'a mut CapabilityChain,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(config: &'a mut ConfigSpace, chain: &'a mut CapabilityChain) -> Self {
        Self { function: config.function(), config, chain }
    }

    /// Install every capability of `plan` in order.
    ///
    /// If any step fails, the capabilities installed by this call are
    /// removed newest first before the error is returned.
    #[instrument(skip(self, sriov), fields(function = %self.function))]
    pub fn install_all(
        &mut self,
        plan: &[CapabilityId],
        sriov: Option<&SriovParams>,
    ) -> Result<()> {
        let mut undo = RollbackStack::new();

        for &id in plan {
            if let Err(e) = self.install(id, sriov) {
                if undo.is_empty() {
                    error!(capability = %id, error = %e, "Base capability install failed");
                } else {
                    warn!(
                        capability = %id,
                        error = %e,
                        rollback = undo.len(),
                        "Capability install failed, rolling back"
                    );
                }
                undo.unwind(|installed| self.uninstall(installed));
                return Err(e);
            }
            undo.push(id);
        }

        undo.commit();
        info!(capabilities = ?self.chain.offsets(), "Capability chain installed");
        Ok(())
    }

    /// Install one capability at its reserved offset.
    ///
    /// # Errors
    ///
    /// - `SlotConflict` if the capability or its offset range is already present,
    ///   or if a later extended capability is installed ahead of it
    /// - `ResourceExhausted` if SR-IOV routing ids would overflow
    /// - `Internal` for MSI-X (see [`install_msix`]) or SR-IOV without parameters
    pub fn install(&mut self, id: CapabilityId, sriov: Option<&SriovParams>) -> Result<()> {
        if self.chain.contains(id) {
            return Err(EduError::SlotConflict {
                function: self.function,
                what: format!("capability {} already installed", id),
            });
        }
        if let Some(later) = self.chain.extended_successor(id) {
            return Err(EduError::SlotConflict {
                function: self.function,
                what: format!("capability {} cannot be appended after {}", id, later),
            });
        }

        let params = match id {
            CapabilityId::Msix => {
                return Err(EduError::Internal(
                    "MSI-X is installed from its vector table".to_string(),
                ))
            }
            CapabilityId::Sriov => {
                let params = sriov.copied().ok_or_else(|| {
                    EduError::Internal("SR-IOV install without parameters".to_string())
                })?;
                self.check_routing(&params)?;
                Some(params)
            }
            _ => None,
        };

        let offset = id.offset();
        self.config.claim(id, offset, id.size())?;

        match id {
            CapabilityId::Express => {
                self.config.add_standard(id.header_id() as u8, offset);
                self.config.write_u16(offset + PCI_EXP_FLAGS, PCI_EXP_FLAGS_ENDPOINT_V2);
                self.config.write_u32(offset + PCI_EXP_DEVCAP, PCI_EXP_DEVCAP_RBER);
                self.config.write_u16(offset + PCI_EXP_LNKCAP, PCI_EXP_LNK_GEN1_X1);
                self.config.write_u16(offset + PCI_EXP_LNKSTA, PCI_EXP_LNK_GEN1_X1);
            }
            CapabilityId::Aer => {
                self.config.add_extended(id.header_id(), id.version(), offset);
                self.config.write_u32(offset + PCI_ERR_UNCOR_SEVER, PCI_ERR_UNC_SEVERITY_DEFAULT);
            }
            CapabilityId::Ari => {
                self.config.add_extended(id.header_id(), id.version(), offset);
                // Next function number 1
                self.config.write_u32(offset + PCI_ARI_CAP, 1 << 8);
            }
            CapabilityId::Ats => {
                self.config.add_extended(id.header_id(), id.version(), offset);
                self.config.write_u16(offset + PCI_ATS_CAP, PCI_ATS_CAP_PAGE_ALIGNED);
            }
            CapabilityId::Sriov => {
                self.config.add_extended(id.header_id(), id.version(), offset);
                if let Some(p) = params {
                    self.config.write_u16(offset + PCI_SRIOV_INITIAL_VF, p.initial_vfs);
                    self.config.write_u16(offset + PCI_SRIOV_TOTAL_VF, p.total_vfs);
                    self.config.write_u16(offset + PCI_SRIOV_VF_OFFSET, p.vf_offset);
                    self.config.write_u16(offset + PCI_SRIOV_VF_STRIDE, p.vf_stride);
                    self.config.write_u16(offset + PCI_SRIOV_VF_DID, p.vf_device_id);
                    self.config
                        .write_u32(offset + PCI_SRIOV_SUP_PGSIZE, PCI_SRIOV_SUP_PGSIZE_DEFAULT);
                    self.config.write_u32(offset + PCI_SRIOV_SYS_PGSIZE, 0x1);
                }
            }
            CapabilityId::Msix => {}
        }

        self.chain.link(id);
        debug!(capability = %id, offset = format_args!("{:#x}", offset), "Installed capability");
        Ok(())
    }

    fn check_routing(&self, params: &SriovParams) -> Result<()> {
        if params.total_vfs == 0 {
            return Ok(());
        }
        let last = FunctionId::vf_routing_id(
            self.function,
            params.vf_offset,
            params.vf_stride,
            params.total_vfs - 1,
        );
        if last.is_none() {
            let requested = u64::from(self.function.routing_id())
                + u64::from(params.vf_offset)
                + u64::from(params.total_vfs - 1) * u64::from(params.vf_stride);
            return Err(EduError::ResourceExhausted {
                resource: "vf routing ids",
                requested,
                limit: u64::from(u16::MAX),
            });
        }
        Ok(())
    }

    /// Remove one capability. No-op if it is not installed.
    pub fn uninstall(&mut self, id: CapabilityId) {
        let Some(record) = self.chain.unlink(id) else {
            debug!(capability = %id, "Capability not installed, skipping");
            return;
        };
        if id.is_extended() {
            self.config.remove_extended(record.offset);
        } else {
            self.config.remove_standard(record.offset);
        }
        self.config.release(record.offset);
        debug!(capability = %id, "Uninstalled capability");
    }

    /// Remove every capability of `plan`, last first. Never fails.
    #[instrument(skip(self), fields(function = %self.function))]
    pub fn teardown(&mut self, plan: &[CapabilityId]) {
        for &id in plan.iter().rev() {
            self.uninstall(id);
        }
    }
}

/// Write the MSI-X capability describing `table`.
pub fn install_msix(config: &mut ConfigSpace, table: &VectorTable) -> Result<()> {
    let id = CapabilityId::Msix;
    let offset = id.offset();
    config.claim(id, offset, id.size())?;
    config.add_standard(id.header_id() as u8, offset);
    let qsize = table.vector_count().saturating_sub(1) & PCI_MSIX_FLAGS_QSIZE;
    config.write_u16(offset + PCI_MSIX_FLAGS, qsize);
    config.write_u32(offset + PCI_MSIX_TABLE, table.table_offset | u32::from(table.bar_slot));
    config.write_u32(offset + PCI_MSIX_PBA, table.pba_offset | u32::from(table.bar_slot));
    debug!(
        function = %config.function(),
        vectors = table.vector_count(),
        "Installed MSI-X capability"
    );
    Ok(())
}

/// Remove the MSI-X capability. No-op if absent.
pub fn remove_msix(config: &mut ConfigSpace) {
    let offset = CapabilityId::Msix.offset();
    if config.claims().iter().any(|c| c.id == CapabilityId::Msix) {
        config.remove_standard(offset);
        config.release(offset);
    }
}

/// Reflect a declared VF BAR template in the SR-IOV VF BAR registers.
pub fn write_vf_bar(config: &mut ConfigSpace, template: &VfBarTemplate) {
    let reg = CapabilityId::Sriov.offset() + PCI_SRIOV_BAR + 4 * u16::from(template.slot);
    let bits = if template.is_64bit { PCI_BASE_ADDRESS_MEM_TYPE_64 } else { 0 };
    config.write_u32(reg, bits);
}

/// Program First VF Offset, VF Stride and VF Device ID.
pub fn write_vf_routing(
    config: &mut ConfigSpace,
    vf_offset: u16,
    vf_stride: u16,
    vf_device_id: u16,
) {
    let base = CapabilityId::Sriov.offset();
    config.write_u16(base + PCI_SRIOV_VF_OFFSET, vf_offset);
    config.write_u16(base + PCI_SRIOV_VF_STRIDE, vf_stride);
    config.write_u16(base + PCI_SRIOV_VF_DID, vf_device_id);
}

/// Set VF Enable and VF MSE and program NumVFs.
pub fn set_vf_enable(config: &mut ConfigSpace, num_vfs: u16) {
    let base = CapabilityId::Sriov.offset();
    let ctrl = config.read_u16(base + PCI_SRIOV_CTRL);
    config.write_u16(base + PCI_SRIOV_CTRL, ctrl | PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE);
    config.write_u16(base + PCI_SRIOV_NUM_VF, num_vfs);
}

/// Clear VF Enable and VF MSE and zero NumVFs.
pub fn clear_vf_enable(config: &mut ConfigSpace) {
    let base = CapabilityId::Sriov.offset();
    let ctrl = config.read_u16(base + PCI_SRIOV_CTRL);
    config.write_u16(base + PCI_SRIOV_CTRL, ctrl & !(PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE));
    config.write_u16(base + PCI_SRIOV_NUM_VF, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::config_space::ext_header;
    use crate::types::{FunctionIdentity, PF_CAPABILITIES, VF_CAPABILITIES};

    fn config_space(id: FunctionId) -> ConfigSpace {
        let identity = FunctionIdentity {
            vendor_id: 0x17db,
            device_id: 0x0001,
            revision: 0,
            class_id: 0xff00,
        };
        ConfigSpace::new(id, &identity)
    }

    fn params() -> SriovParams {
        SriovParams {
            total_vfs: 16,
            initial_vfs: 16,
            vf_offset: 0x80,
            vf_stride: 2,
            vf_device_id: 0x0002,
        }
    }

    #[test]
    fn test_pf_chain_layout() {
        let mut config = config_space(FunctionId::new(0));
        let mut chain = CapabilityChain::new();
        ChainBuilder::new(&mut config, &mut chain)
            .install_all(PF_CAPABILITIES, Some(&params()))
            .unwrap();

        assert_eq!(chain.offsets(), vec![0xa0, 0x100, 0x150, 0x140, 0x160]);
        assert_eq!(chain.records()[0].next, Some(0x100));
        assert_eq!(chain.records()[4].prev, Some(0x140));

        assert_eq!(config.walk_standard(), vec![0xa0]);
        assert_eq!(config.walk_extended(), vec![0x100, 0x150, 0x140, 0x160]);
        assert_eq!(config.read_u32(0x100), ext_header(0x0001, 2, 0x150));
        assert_eq!(config.read_u32(0x150 + PCI_ARI_CAP), 0x100);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_TOTAL_VF), 16);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_VF_OFFSET), 0x80);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_VF_DID), 0x0002);
        assert_eq!(config.read_u32(0x160 + PCI_SRIOV_SUP_PGSIZE), 0x553);
    }

    #[test]
    fn test_vf_chain_layout() {
        let mut config = config_space(FunctionId::new(0x80));
        let mut chain = CapabilityChain::new();
        ChainBuilder::new(&mut config, &mut chain).install_all(VF_CAPABILITIES, None).unwrap();

        assert_eq!(chain.offsets(), vec![0xa0, 0x100, 0x150]);
        assert_eq!(config.walk_extended(), vec![0x100, 0x150]);
    }

    #[test]
    fn test_aer_failure_removes_express() {
        let mut config = config_space(FunctionId::new(0));
        config.claim(CapabilityId::Ats, 0x120, 0x08).unwrap();
        let mut chain = CapabilityChain::new();

        let err = ChainBuilder::new(&mut config, &mut chain)
            .install_all(PF_CAPABILITIES, Some(&params()))
            .unwrap_err();

        assert!(matches!(err, EduError::SlotConflict { .. }));
        assert!(chain.is_empty());
        assert!(config.walk_standard().is_empty());
        assert!(!config.is_claimed(0xa0));
    }

    #[test]
    fn test_express_conflict_is_fatal() {
        let mut config = config_space(FunctionId::new(0));
        config.claim(CapabilityId::Msix, 0xa0, 0x0c).unwrap();
        let mut chain = CapabilityChain::new();

        let err = ChainBuilder::new(&mut config, &mut chain)
            .install_all(VF_CAPABILITIES, None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_sriov_routing_overflow_rolls_back_everything() {
        let mut config = config_space(FunctionId::new(0xff90));
        let mut chain = CapabilityChain::new();

        let err = ChainBuilder::new(&mut config, &mut chain)
            .install_all(PF_CAPABILITIES, Some(&params()))
            .unwrap_err();

        assert!(err.is_recoverable());
        assert!(chain.is_empty());
        assert!(config.claims().is_empty());
        assert!(config.walk_standard().is_empty());
        assert!(config.walk_extended().is_empty());
    }

    #[test]
    fn test_uninstall_list_head_keeps_rest_reachable() {
        let mut config = config_space(FunctionId::new(0));
        let mut chain = CapabilityChain::new();
        let mut builder = ChainBuilder::new(&mut config, &mut chain);
        builder.install_all(PF_CAPABILITIES, Some(&params())).unwrap();

        builder.uninstall(CapabilityId::Aer);
        builder.uninstall(CapabilityId::Aer);

        assert_eq!(chain.offsets(), vec![0xa0, 0x150, 0x140, 0x160]);
        assert_eq!(config.walk_extended(), vec![0x150, 0x140, 0x160]);
        assert!(!config.is_claimed(0x104));
    }

    #[test]
    fn test_reinstall_list_head_restores_chain() {
        let mut config = config_space(FunctionId::new(0));
        let mut chain = CapabilityChain::new();
        let mut builder = ChainBuilder::new(&mut config, &mut chain);
        builder.install_all(PF_CAPABILITIES, Some(&params())).unwrap();

        builder.uninstall(CapabilityId::Aer);
        builder.install(CapabilityId::Aer, None).unwrap();

        assert_eq!(chain.offsets(), vec![0xa0, 0x100, 0x150, 0x140, 0x160]);
        assert_eq!(chain.records()[1].prev, Some(0xa0));
        assert_eq!(chain.records()[1].next, Some(0x150));
        assert_eq!(chain.records()[2].prev, Some(0x100));
        assert_eq!(config.walk_extended(), vec![0x100, 0x150, 0x140, 0x160]);
        assert_eq!(config.read_u32(0x100), ext_header(0x0001, 2, 0x150));
        assert_eq!(config.read_u32(0x100 + PCI_ERR_UNCOR_SEVER), PCI_ERR_UNC_SEVERITY_DEFAULT);
    }

    #[test]
    fn test_reinstall_behind_later_capability_rejected() {
        let mut config = config_space(FunctionId::new(0));
        let mut chain = CapabilityChain::new();
        let mut builder = ChainBuilder::new(&mut config, &mut chain);
        builder.install_all(PF_CAPABILITIES, Some(&params())).unwrap();

        builder.uninstall(CapabilityId::Ari);
        let err = builder.install(CapabilityId::Ari, None).unwrap_err();
        assert!(matches!(err, EduError::SlotConflict { .. }));

        // Removing the later capabilities lets it back in at the tail
        builder.uninstall(CapabilityId::Sriov);
        builder.uninstall(CapabilityId::Ats);
        builder.install(CapabilityId::Ari, None).unwrap();

        assert_eq!(chain.offsets(), vec![0xa0, 0x100, 0x150]);
        assert_eq!(config.walk_extended(), vec![0x100, 0x150]);
        assert!(!config.is_claimed(0x140));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut config = config_space(FunctionId::new(0x80));
        let mut chain = CapabilityChain::new();
        let mut builder = ChainBuilder::new(&mut config, &mut chain);
        builder.install_all(VF_CAPABILITIES, None).unwrap();

        builder.teardown(PF_CAPABILITIES);
        builder.teardown(PF_CAPABILITIES);

        assert!(chain.is_empty());
        assert!(config.claims().is_empty());
    }

    #[test]
    fn test_sriov_enable_bits() {
        let mut config = config_space(FunctionId::new(0));
        let mut chain = CapabilityChain::new();
        ChainBuilder::new(&mut config, &mut chain)
            .install_all(PF_CAPABILITIES, Some(&params()))
            .unwrap();

        write_vf_bar(&mut config, &VfBarTemplate { slot: 0, size: 4096, is_64bit: true });
        set_vf_enable(&mut config, 16);
        assert_eq!(config.read_u32(0x160 + PCI_SRIOV_BAR), PCI_BASE_ADDRESS_MEM_TYPE_64);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_NUM_VF), 16);
        assert_eq!(
            config.read_u16(0x160 + PCI_SRIOV_CTRL),
            PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE
        );

        clear_vf_enable(&mut config);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_CTRL), 0);
        assert_eq!(config.read_u16(0x160 + PCI_SRIOV_NUM_VF), 0);
    }
}
