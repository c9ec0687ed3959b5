//! PCIe EDU Core Library
//!
//! Device model of a virtual PCI-Express endpoint with SR-IOV: one physical
//! function that spawns up to TotalVFs virtual functions, each with its own
//! BARs, MSI-X table and capability chain.

pub mod config;
pub mod error;
pub mod function;
pub mod host;
pub mod observability;
pub mod pci;
pub mod resources;
pub mod rollback;
pub mod sriov;
pub mod types;

// Re-export commonly used items
pub use config::{EduConfig, FunctionConfig, SriovConfig};
pub use error::{EduError, Result};
pub use function::{FunctionLifecycle, PhysicalFunction, VirtualFunction};
pub use host::{AddressSpace, MmioHandler, TracingAddressSpace, TracingMmio};
pub use observability::init as init_observability;
pub use resources::{DeviceResources, MemoryRegion, RegionHandle, RegionKind, TableHandle};
pub use sriov::{DeviceSnapshot, SriovSupervisor};
pub use types::{CapabilityId, FunctionId, FunctionKind, LifecycleState};
