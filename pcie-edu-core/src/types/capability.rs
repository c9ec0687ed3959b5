//! Capability identifiers and the fixed configuration-space layout.

use super::FunctionKind;
use serde::{Deserialize, Serialize};

/// Offset of the Express capability (standard list).
pub const EXPRESS_OFFSET: u16 = 0xa0;
/// Offset of the MSI-X capability (standard list).
pub const MSIX_OFFSET: u16 = 0x70;
/// Offset of Advanced Error Reporting (head of the extended list).
pub const AER_OFFSET: u16 = 0x100;
/// Offset of Address Translation Services.
pub const ATS_OFFSET: u16 = 0x140;
/// Offset of Alternate Routing-ID Interpretation.
pub const ARI_OFFSET: u16 = 0x150;
/// Offset of the SR-IOV capability.
pub const SRIOV_OFFSET: u16 = 0x160;

/// Install order for a physical function.
pub const PF_CAPABILITIES: &[CapabilityId] = &[
    CapabilityId::Express,
    CapabilityId::Aer,
    CapabilityId::Ari,
    CapabilityId::Ats,
    CapabilityId::Sriov,
];

/// Install order for a virtual function.
pub const VF_CAPABILITIES: &[CapabilityId] =
    &[CapabilityId::Express, CapabilityId::Aer, CapabilityId::Ari];

/// Capabilities this device can place in configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityId {
    Express,
    Msix,
    Aer,
    Ari,
    Ats,
    Sriov,
}

impl CapabilityId {
    /// Reserved offset. Never computed at runtime so the layout is stable
    /// across save/restore.
    pub const fn offset(self) -> u16 {
        match self {
            Self::Express => EXPRESS_OFFSET,
            Self::Msix => MSIX_OFFSET,
            Self::Aer => AER_OFFSET,
            Self::Ari => ARI_OFFSET,
            Self::Ats => ATS_OFFSET,
            Self::Sriov => SRIOV_OFFSET,
        }
    }

    /// Size of the register block in bytes.
    pub const fn size(self) -> u16 {
        match self {
            Self::Express => 0x3c,
            Self::Msix => 0x0c,
            // Endpoint AER without the TLP prefix log
            Self::Aer => 0x38,
            Self::Ari => 0x08,
            Self::Ats => 0x08,
            Self::Sriov => 0x40,
        }
    }

    /// Capability id as encoded in the header.
    pub const fn header_id(self) -> u16 {
        match self {
            Self::Express => 0x10,
            Self::Msix => 0x11,
            Self::Aer => 0x0001,
            Self::Ari => 0x000e,
            Self::Ats => 0x000f,
            Self::Sriov => 0x0010,
        }
    }

    /// Extended capability version (0 for standard capabilities).
    pub const fn version(self) -> u8 {
        match self {
            Self::Aer => 2,
            Self::Ari | Self::Ats | Self::Sriov => 1,
            Self::Express | Self::Msix => 0,
        }
    }

    /// Whether the capability lives in the extended list (offset >= 0x100).
    pub const fn is_extended(self) -> bool {
        self.offset() >= 0x100
    }

    /// Capabilities installed by the chain builder for `kind`, in order.
    pub fn plan_for(kind: FunctionKind) -> &'static [CapabilityId] {
        match kind {
            FunctionKind::Pf => PF_CAPABILITIES,
            FunctionKind::Vf => VF_CAPABILITIES,
        }
    }
}

impl std::fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Express => write!(f, "express"),
            Self::Msix => write!(f, "msix"),
            Self::Aer => write!(f, "aer"),
            Self::Ari => write!(f, "ari"),
            Self::Ats => write!(f, "ats"),
            Self::Sriov => write!(f, "sriov"),
        }
    }
}

/// One installed capability, linked to its neighbours in install order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: CapabilityId,
    pub offset: u16,
    pub size: u16,
    pub prev: Option<u16>,
    pub next: Option<u16>,
}

impl CapabilityRecord {
    /// End offset (exclusive).
    pub fn end(&self) -> u16 {
        self.offset + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_does_not_overlap() {
        let all = [
            CapabilityId::Msix,
            CapabilityId::Express,
            CapabilityId::Aer,
            CapabilityId::Ats,
            CapabilityId::Ari,
            CapabilityId::Sriov,
        ];
        let mut ranges: Vec<(u16, u16)> =
            all.iter().map(|c| (c.offset(), c.offset() + c.size())).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_plans() {
        assert_eq!(CapabilityId::plan_for(FunctionKind::Pf).len(), 5);
        assert_eq!(
            CapabilityId::plan_for(FunctionKind::Vf),
            &[CapabilityId::Express, CapabilityId::Aer, CapabilityId::Ari]
        );
        assert!(CapabilityId::Aer.is_extended());
        assert!(!CapabilityId::Express.is_extended());
    }
}
