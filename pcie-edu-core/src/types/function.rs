//! Function instance domain types.

use serde::{Deserialize, Serialize};

/// Routing identity of a PCIe function (bus << 8 | device << 3 | function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(u16);

impl FunctionId {
    pub const fn new(routing_id: u16) -> Self {
        Self(routing_id)
    }

    pub const fn routing_id(self) -> u16 {
        self.0
    }

    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn device(self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub const fn function(self) -> u8 {
        (self.0 & 0x7) as u8
    }

    /// Routing id of VF `index` given the PF id and the SR-IOV offset/stride.
    ///
    /// Returns `None` when the result does not fit in 16 bits.
    pub fn vf_routing_id(pf: FunctionId, offset: u16, stride: u16, index: u16) -> Option<Self> {
        let rid = u32::from(pf.0) + u32::from(offset) + u32::from(stride) * u32::from(index);
        u16::try_from(rid).ok().map(Self)
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus(), self.device(), self.function())
    }
}

/// Physical or virtual function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Pf,
    Vf,
}

impl FunctionKind {
    /// Host type name of the function.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Pf => "pcie_edu",
            Self::Vf => "pcie_edu_vf",
        }
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pf => write!(f, "pf"),
            Self::Vf => write!(f, "vf"),
        }
    }
}

/// Lifecycle state of a function instance.
///
/// ```text
/// Uninitialized -> Realizing -> Active -> Exiting -> Destroyed
///                      |                     ^
///                      +---- (failure) ------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Created, nothing reserved yet
    Uninitialized,

    /// Regions, vectors and capabilities are being set up
    Realizing,

    /// Fully realized and usable by the host
    Active,

    /// Teardown in progress
    Exiting,

    /// Everything released; terminal
    Destroyed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Realizing => write!(f, "realizing"),
            Self::Active => write!(f, "active"),
            Self::Exiting => write!(f, "exiting"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Identity registers of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    /// Base class << 8 | subclass
    pub class_id: u16,
}
