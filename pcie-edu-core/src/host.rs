//! Host collaborator interfaces.
//!
//! The device model never touches guest memory or the host's object system
//! directly. It reports region mappings through [`AddressSpace`] and forwards
//! data-plane accesses to an [`MmioHandler`].

use crate::resources::MemoryRegion;
use crate::types::FunctionId;
use tracing::debug;

/// Address-space mapping table owned by the host.
///
/// Called by the region registry whenever a BAR window is reserved or released.
pub trait AddressSpace: Send {
    /// A region has been reserved and may be mapped by the host.
    fn map(&mut self, region: &MemoryRegion);

    /// A region has been released and must no longer be dispatched to.
    fn unmap(&mut self, region: &MemoryRegion);
}

/// Opaque MMIO data plane.
pub trait MmioHandler: Send {
    fn read(&mut self, function: FunctionId, offset: u64, size: u8) -> u64;

    fn write(&mut self, function: FunctionId, offset: u64, value: u64, size: u8);
}

/// Address space that only logs mapping changes.
#[derive(Debug, Default)]
pub struct TracingAddressSpace;

impl AddressSpace for TracingAddressSpace {
    fn map(&mut self, region: &MemoryRegion) {
        debug!(
            function = %region.owner,
            slot = region.slot,
            size = region.size,
            name = %region.name,
            "Mapping region"
        );
    }

    fn unmap(&mut self, region: &MemoryRegion) {
        debug!(
            function = %region.owner,
            slot = region.slot,
            name = %region.name,
            "Unmapping region"
        );
    }
}

/// Data plane stub: reads return zero, writes are logged and dropped.
#[derive(Debug, Default)]
pub struct TracingMmio;

impl MmioHandler for TracingMmio {
    fn read(&mut self, function: FunctionId, offset: u64, size: u8) -> u64 {
        debug!(function = %function, addr = format_args!("{:#x}", offset), size, "MMIO read");
        0
    }

    fn write(&mut self, function: FunctionId, offset: u64, value: u64, size: u8) {
        debug!(
            function = %function,
            addr = format_args!("{:#x}", offset),
            val = format_args!("{:#x}", value),
            size,
            "MMIO write"
        );
    }
}
