//! Memory region (BAR) registry.
//!
//! This module tracks the address-space windows each function exposes and
//! keeps the host mapping table in sync. VF windows are never sized on their
//! own: the PF declares a per-VF template once and every VF reserves from it.

use crate::error::{EduError, Result};
use crate::host::{AddressSpace, TracingAddressSpace};
use crate::observability::metrics;
use crate::types::FunctionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

/// Number of BAR registers in a type 0 header.
pub const NUM_BAR_SLOTS: u8 = 6;

/// Smallest memory BAR a function may expose.
pub const MIN_BAR_SIZE: u64 = 16;

/// Handle to a reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionHandle(u64);

impl RegionHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What a region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Data-plane window dispatched to the MMIO handler
    Mmio,
    /// Container for the MSI-X table and pending-bit array
    MsixWindow,
}

/// A reserved BAR window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub handle: RegionHandle,
    pub owner: FunctionId,
    pub slot: u8,
    pub size: u64,
    pub is_64bit: bool,
    pub kind: RegionKind,
    pub name: String,
}

/// Per-VF BAR template declared by a PF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfBarTemplate {
    pub slot: u8,
    pub size: u64,
    pub is_64bit: bool,
}

/// Tracks every BAR window of every function of one device.
pub struct RegionRegistry {
    regions: BTreeMap<RegionHandle, MemoryRegion>,
    /// PF id -> slot -> template
    vf_templates: HashMap<FunctionId, BTreeMap<u8, VfBarTemplate>>,
    address_space: Box<dyn AddressSpace>,
    next_handle: u64,
}

impl RegionRegistry {
    /// Create a registry that only logs mapping changes.
    pub fn new() -> Self {
        Self::with_address_space(Box::new(TracingAddressSpace))
    }

    /// Create a registry reporting to a host mapping table.
    pub fn with_address_space(address_space: Box<dyn AddressSpace>) -> Self {
        Self {
            regions: BTreeMap::new(),
            vf_templates: HashMap::new(),
            address_space,
            next_handle: 1,
        }
    }

    /// Reserve a BAR window for `function`.
    ///
    /// A 64-bit BAR also occupies the following slot.
    ///
    /// # Errors
    ///
    /// `SlotConflict` if the slot (or its upper half) is taken, `SizeInvalid`
    /// if the size is not a power of two of at least [`MIN_BAR_SIZE`] or the
    /// slot number is out of range.
    #[instrument(skip(self, kind), fields(function = %function))]
    pub fn reserve(
        &mut self,
        function: FunctionId,
        slot: u8,
        size: u64,
        is_64bit: bool,
        kind: RegionKind,
    ) -> Result<RegionHandle> {
        let last_slot = u16::from(slot) + u16::from(is_64bit);
        if last_slot >= u16::from(NUM_BAR_SLOTS) {
            return Err(EduError::SizeInvalid {
                function,
                slot,
                size,
                reason: format!("slot out of range (max {})", NUM_BAR_SLOTS - 1),
            });
        }
        if size < MIN_BAR_SIZE || !size.is_power_of_two() {
            return Err(EduError::SizeInvalid {
                function,
                slot,
                size,
                reason: "size must be a power of two of at least 16 bytes".to_string(),
            });
        }
        if !is_64bit && size > u64::from(u32::MAX) {
            return Err(EduError::SizeInvalid {
                function,
                slot,
                size,
                reason: "size does not fit a 32-bit BAR".to_string(),
            });
        }

        if let Some(taken) = self.occupant(function, slot).or_else(|| {
            if is_64bit {
                self.occupant(function, slot + 1)
            } else {
                None
            }
        }) {
            return Err(EduError::SlotConflict {
                function,
                what: format!("BAR {} (held by {})", slot, taken.name),
            });
        }

        let handle = RegionHandle(self.next_handle);
        self.next_handle += 1;

        let region = MemoryRegion {
            handle,
            owner: function,
            slot,
            size,
            is_64bit,
            kind,
            name: region_name(function, slot, kind),
        };
        self.address_space.map(&region);
        info!(slot, size, is_64bit, "Reserved BAR {} for {}", slot, function);
        self.regions.insert(handle, region);
        metrics::set_regions_held(self.regions.len());

        Ok(handle)
    }

    /// Declare the per-VF size of `slot` for VFs of `pf`.
    ///
    /// One-time: declaring the same slot twice is a `SlotConflict`.
    #[instrument(skip(self), fields(pf = %pf))]
    pub fn declare_vf_bar_template(
        &mut self,
        pf: FunctionId,
        slot: u8,
        size: u64,
        is_64bit: bool,
    ) -> Result<()> {
        let last_slot = u16::from(slot) + u16::from(is_64bit);
        if last_slot >= u16::from(NUM_BAR_SLOTS) || size < MIN_BAR_SIZE || !size.is_power_of_two() {
            return Err(EduError::SizeInvalid {
                function: pf,
                slot,
                size,
                reason: "invalid VF BAR template".to_string(),
            });
        }

        let templates = self.vf_templates.entry(pf).or_default();
        if templates.contains_key(&slot) {
            return Err(EduError::SlotConflict {
                function: pf,
                what: format!("VF BAR {} template", slot),
            });
        }
        templates.insert(slot, VfBarTemplate { slot, size, is_64bit });
        debug!(slot, size, "Declared VF BAR template");
        Ok(())
    }

    /// Template previously declared by `pf` for `slot`.
    pub fn vf_bar_template(&self, pf: FunctionId, slot: u8) -> Option<VfBarTemplate> {
        self.vf_templates.get(&pf).and_then(|t| t.get(&slot)).copied()
    }

    /// All templates declared by `pf`, ordered by slot.
    pub fn vf_bar_templates(&self, pf: FunctionId) -> Vec<VfBarTemplate> {
        self.vf_templates.get(&pf).map(|t| t.values().copied().collect()).unwrap_or_default()
    }

    /// Drop every template declared by `pf`. Idempotent.
    pub fn clear_vf_bar_templates(&mut self, pf: FunctionId) {
        if self.vf_templates.remove(&pf).is_some() {
            debug!(pf = %pf, "Cleared VF BAR templates");
        }
    }

    /// Reserve `slot` for a VF using the size its PF declared.
    ///
    /// # Errors
    ///
    /// `BarMissing` if the PF declared no template for `slot`, otherwise as
    /// [`reserve`](Self::reserve).
    pub fn reserve_vf_bar(
        &mut self,
        vf: FunctionId,
        pf: FunctionId,
        slot: u8,
        kind: RegionKind,
    ) -> Result<RegionHandle> {
        let template =
            self.vf_bar_template(pf, slot).ok_or(EduError::BarMissing { function: vf, slot })?;
        self.reserve(vf, slot, template.size, template.is_64bit, kind)
    }

    /// Release a region. Idempotent and infallible.
    #[instrument(skip(self))]
    pub fn release(&mut self, handle: RegionHandle) {
        match self.regions.remove(&handle) {
            Some(region) => {
                self.address_space.unmap(&region);
                info!(slot = region.slot, "Released BAR {} of {}", region.slot, region.owner);
                metrics::set_regions_held(self.regions.len());
            }
            None => {
                debug!(handle = handle.raw(), "Attempted to release region which was not reserved");
            }
        }
    }

    /// Release every region held by `function`.
    pub fn release_all(&mut self, function: FunctionId) {
        let handles: Vec<RegionHandle> =
            self.regions.values().filter(|r| r.owner == function).map(|r| r.handle).collect();
        for handle in handles {
            self.release(handle);
        }
    }

    pub fn get(&self, handle: RegionHandle) -> Option<&MemoryRegion> {
        self.regions.get(&handle)
    }

    /// Region of `function` starting at `slot`.
    pub fn region_at(&self, function: FunctionId, slot: u8) -> Option<&MemoryRegion> {
        self.regions.values().find(|r| r.owner == function && r.slot == slot)
    }

    /// Number of regions held by `function`.
    pub fn regions_held(&self, function: FunctionId) -> usize {
        self.regions.values().filter(|r| r.owner == function).count()
    }

    /// Number of regions held across the device.
    pub fn total_held(&self) -> usize {
        self.regions.len()
    }

    /// Region covering `slot`, including the upper half of a 64-bit BAR.
    fn occupant(&self, function: FunctionId, slot: u8) -> Option<&MemoryRegion> {
        self.regions.values().find(|r| {
            r.owner == function && (r.slot == slot || (r.is_64bit && r.slot + 1 == slot))
        })
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("regions", &self.regions.len())
            .field("vf_templates", &self.vf_templates.len())
            .finish()
    }
}

fn region_name(function: FunctionId, slot: u8, kind: RegionKind) -> String {
    match kind {
        RegionKind::Mmio => format!("pcie_edu_mmio{}@{}", slot, function),
        RegionKind::MsixWindow => format!("pcie_edu-msix@{}", function),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PF: FunctionId = FunctionId::new(0);
    const VF0: FunctionId = FunctionId::new(0x80);

    #[test]
    fn test_reserve_basic() {
        let mut registry = RegionRegistry::new();

        let bar0 = registry.reserve(PF, 0, 0x8000_0000, true, RegionKind::Mmio).unwrap();
        let bar2 = registry.reserve(PF, 2, 16 * 1024, false, RegionKind::MsixWindow).unwrap();

        assert_ne!(bar0, bar2);
        assert_eq!(registry.regions_held(PF), 2);
        assert_eq!(registry.region_at(PF, 0).unwrap().size, 0x8000_0000);
        assert_eq!(registry.get(bar2).unwrap().kind, RegionKind::MsixWindow);
    }

    #[test]
    fn test_reserve_slot_conflict() {
        let mut registry = RegionRegistry::new();
        registry.reserve(PF, 0, 4096, true, RegionKind::Mmio).unwrap();

        // Slot 1 is the upper half of the 64-bit BAR 0
        let err = registry.reserve(PF, 1, 4096, false, RegionKind::Mmio).unwrap_err();
        assert!(matches!(err, EduError::SlotConflict { .. }));

        let err = registry.reserve(PF, 0, 4096, false, RegionKind::Mmio).unwrap_err();
        assert!(matches!(err, EduError::SlotConflict { .. }));

        // Same slot on another function is fine
        assert!(registry.reserve(VF0, 0, 4096, true, RegionKind::Mmio).is_ok());
    }

    #[test]
    fn test_reserve_size_invalid() {
        let mut registry = RegionRegistry::new();

        assert!(matches!(
            registry.reserve(PF, 0, 3000, false, RegionKind::Mmio),
            Err(EduError::SizeInvalid { .. })
        ));
        assert!(matches!(
            registry.reserve(PF, 5, 4096, true, RegionKind::Mmio),
            Err(EduError::SizeInvalid { .. })
        ));
        assert!(matches!(
            registry.reserve(PF, 0, 1 << 33, false, RegionKind::Mmio),
            Err(EduError::SizeInvalid { .. })
        ));
        assert_eq!(registry.total_held(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut registry = RegionRegistry::new();
        let handle = registry.reserve(PF, 0, 4096, false, RegionKind::Mmio).unwrap();

        registry.release(handle);
        registry.release(handle);

        assert_eq!(registry.regions_held(PF), 0);
        assert!(registry.get(handle).is_none());
    }

    #[test]
    fn test_vf_templates() {
        let mut registry = RegionRegistry::new();

        // No template yet
        assert!(matches!(
            registry.reserve_vf_bar(VF0, PF, 0, RegionKind::Mmio),
            Err(EduError::BarMissing { slot: 0, .. })
        ));

        registry.declare_vf_bar_template(PF, 0, 4096, true).unwrap();
        assert!(matches!(
            registry.declare_vf_bar_template(PF, 0, 8192, true),
            Err(EduError::SlotConflict { .. })
        ));

        let vf1 = FunctionId::new(0x82);
        registry.reserve_vf_bar(VF0, PF, 0, RegionKind::Mmio).unwrap();
        registry.reserve_vf_bar(vf1, PF, 0, RegionKind::Mmio).unwrap();
        assert_eq!(registry.region_at(VF0, 0).unwrap().size, 4096);
        assert_eq!(registry.region_at(vf1, 0).unwrap().size, 4096);

        registry.clear_vf_bar_templates(PF);
        registry.clear_vf_bar_templates(PF);
        assert!(registry.vf_bar_template(PF, 0).is_none());
    }

    #[test]
    fn test_release_all() {
        let mut registry = RegionRegistry::new();
        registry.reserve(PF, 0, 4096, true, RegionKind::Mmio).unwrap();
        registry.reserve(PF, 2, 4096, false, RegionKind::MsixWindow).unwrap();
        registry.reserve(VF0, 0, 4096, true, RegionKind::Mmio).unwrap();

        registry.release_all(PF);

        assert_eq!(registry.regions_held(PF), 0);
        assert_eq!(registry.regions_held(VF0), 1);
    }
}
