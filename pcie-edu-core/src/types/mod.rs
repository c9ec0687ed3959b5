//! Core domain types for the device model.

pub mod capability;
pub mod function;

// Re-exports
pub use capability::{CapabilityId, CapabilityRecord, PF_CAPABILITIES, VF_CAPABILITIES};
pub use function::{FunctionId, FunctionIdentity, FunctionKind, LifecycleState};
