//! Configuration-space image of one function.
//!
//! Holds the 4 KiB register file, tracks which byte ranges are claimed by
//! which capability, and maintains the standard (0x34-rooted) and extended
//! (0x100-rooted) capability lists exactly as inspection tooling walks them.

use crate::error::{EduError, Result};
use crate::types::{CapabilityId, FunctionId, FunctionIdentity};
use serde::{Deserialize, Serialize};

/// Size of PCIe configuration space.
pub const PCIE_CONFIG_SPACE_SIZE: usize = 0x1000;
/// Size of legacy PCI configuration space; extended capabilities start here.
pub const PCI_CONFIG_SPACE_SIZE: u16 = 0x100;
/// End of the type 0 header.
pub const PCI_HEADER_END: u16 = 0x40;

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_REVISION_ID: u16 = 0x08;
pub const PCI_CLASS_DEVICE: u16 = 0x0a;
pub const PCI_HEADER_TYPE: u16 = 0x0e;
pub const PCI_CAPABILITY_LIST: u16 = 0x34;

/// Status register: capabilities list present.
pub const PCI_STATUS_CAP_LIST: u16 = 0x0010;

/// Upper bound on list walks; guards against malformed pointers.
const MAX_CAPABILITY_CHAIN: usize = 64;

/// A byte range owned by a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: CapabilityId,
    pub offset: u16,
    pub size: u16,
}

impl Claim {
    fn overlaps(&self, offset: u16, size: u16) -> bool {
        self.offset < offset + size && offset < self.offset + self.size
    }
}

/// Register file and capability bookkeeping of one function.
#[derive(Clone)]
pub struct ConfigSpace {
    function: FunctionId,
    data: Box<[u8; PCIE_CONFIG_SPACE_SIZE]>,
    claims: Vec<Claim>,
}

impl ConfigSpace {
    /// Create a config space with the identity header filled in.
    pub fn new(function: FunctionId, identity: &FunctionIdentity) -> Self {
        let mut config =
            Self { function, data: Box::new([0u8; PCIE_CONFIG_SPACE_SIZE]), claims: Vec::new() };
        config.write_u16(PCI_VENDOR_ID, identity.vendor_id);
        config.write_u16(PCI_DEVICE_ID, identity.device_id);
        config.write_u8(PCI_REVISION_ID, identity.revision);
        config.write_u16(PCI_CLASS_DEVICE, identity.class_id);
        config.write_u8(PCI_HEADER_TYPE, 0);
        config
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Bytes past the end of config space read as 0xff.
    pub fn read_u8(&self, offset: u16) -> u8 {
        self.byte(usize::from(offset))
    }

    pub fn read_u16(&self, offset: u16) -> u16 {
        let base = usize::from(offset);
        u16::from_le_bytes([self.byte(base), self.byte(base + 1)])
    }

    pub fn read_u32(&self, offset: u16) -> u32 {
        let base = usize::from(offset);
        u32::from_le_bytes([
            self.byte(base),
            self.byte(base + 1),
            self.byte(base + 2),
            self.byte(base + 3),
        ])
    }

    fn byte(&self, index: usize) -> u8 {
        self.data.get(index).copied().unwrap_or(0xff)
    }

    pub(crate) fn write_u8(&mut self, offset: u16, value: u8) {
        self.write_bytes(offset, &[value]);
    }

    pub(crate) fn write_u16(&mut self, offset: u16, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub(crate) fn write_u32(&mut self, offset: u16, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    // Bytes past the end of config space are dropped.
    fn write_bytes(&mut self, offset: u16, bytes: &[u8]) {
        let base = usize::from(offset);
        for (i, value) in bytes.iter().enumerate() {
            if let Some(byte) = self.data.get_mut(base + i) {
                *byte = *value;
            }
        }
    }

    /// Claim `offset..offset + size` for `id`.
    ///
    /// # Errors
    ///
    /// `SlotConflict` if the range overlaps the header, another claim, or
    /// crosses the legacy/extended boundary.
    pub fn claim(&mut self, id: CapabilityId, offset: u16, size: u16) -> Result<()> {
        let end = usize::from(offset) + usize::from(size);
        let crosses_boundary =
            offset < PCI_CONFIG_SPACE_SIZE && end > usize::from(PCI_CONFIG_SPACE_SIZE);
        if offset < PCI_HEADER_END || end > PCIE_CONFIG_SPACE_SIZE || crosses_boundary {
            return Err(EduError::SlotConflict {
                function: self.function,
                what: format!(
                    "config space {:#x}..{:#x} for {} (outside capability area)",
                    offset, end, id
                ),
            });
        }
        if let Some(existing) = self.claims.iter().find(|c| c.overlaps(offset, size)) {
            return Err(EduError::SlotConflict {
                function: self.function,
                what: format!(
                    "config space {:#x}..{:#x} for {} (held by {} at {:#x})",
                    offset, end, id, existing.id, existing.offset
                ),
            });
        }
        self.claims.push(Claim { id, offset, size });
        Ok(())
    }

    /// Release the claim starting at `offset` and zero its bytes. Idempotent.
    pub fn release(&mut self, offset: u16) -> Option<Claim> {
        let pos = self.claims.iter().position(|c| c.offset == offset)?;
        let claim = self.claims.remove(pos);
        let end = usize::from(claim.offset) + usize::from(claim.size);
        let mut start = usize::from(claim.offset);
        // A null list head keeps its next pointer
        if claim.offset == PCI_CONFIG_SPACE_SIZE && self.read_u32(claim.offset) & 0xffff == 0 {
            start += 4;
        }
        self.data[start..end].fill(0);
        Some(claim)
    }

    pub fn is_claimed(&self, offset: u16) -> bool {
        self.claims.iter().any(|c| c.offset <= offset && offset < c.offset + c.size)
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Insert a standard capability at the head of the 0x34 list.
    pub(crate) fn add_standard(&mut self, id: u8, offset: u16) {
        let head = self.read_u8(PCI_CAPABILITY_LIST);
        self.write_u8(offset, id);
        self.write_u8(offset + 1, head);
        self.write_u8(PCI_CAPABILITY_LIST, offset as u8);
        let status = self.read_u16(PCI_STATUS);
        self.write_u16(PCI_STATUS, status | PCI_STATUS_CAP_LIST);
    }

    /// Unlink a standard capability. No-op if it is not on the list.
    pub(crate) fn remove_standard(&mut self, offset: u16) {
        let mut link = PCI_CAPABILITY_LIST;
        for _ in 0..MAX_CAPABILITY_CHAIN {
            let ptr = u16::from(self.read_u8(link));
            if ptr == 0 {
                return;
            }
            if ptr == offset {
                let next = self.read_u8(offset + 1);
                self.write_u8(link, next);
                break;
            }
            link = ptr + 1;
        }
        if self.read_u8(PCI_CAPABILITY_LIST) == 0 {
            let status = self.read_u16(PCI_STATUS);
            self.write_u16(PCI_STATUS, status & !PCI_STATUS_CAP_LIST);
        }
    }

    /// Append an extended capability to the 0x100 list. Filling a null head
    /// at 0x100 keeps the rest of the list linked behind it.
    pub(crate) fn add_extended(&mut self, id: u16, version: u8, offset: u16) {
        if offset == PCI_CONFIG_SPACE_SIZE {
            let next = ext_next(self.read_u32(offset));
            self.write_u32(offset, ext_header(id, version, next));
            return;
        }
        self.write_u32(offset, ext_header(id, version, 0));

        let mut tail = PCI_CONFIG_SPACE_SIZE;
        for _ in 0..MAX_CAPABILITY_CHAIN {
            let next = ext_next(self.read_u32(tail));
            if next == 0 || next == offset {
                break;
            }
            tail = next;
        }
        self.set_ext_next(tail, offset);
    }

    /// Unlink an extended capability. The list head at 0x100 cannot move, so
    /// removing it leaves a null header that still points at the rest.
    pub(crate) fn remove_extended(&mut self, offset: u16) {
        let next = ext_next(self.read_u32(offset));
        if offset == PCI_CONFIG_SPACE_SIZE {
            self.write_u32(offset, ext_header(0, 0, next));
            return;
        }

        let mut cursor = PCI_CONFIG_SPACE_SIZE;
        for _ in 0..MAX_CAPABILITY_CHAIN {
            let header = self.read_u32(cursor);
            let ptr = ext_next(header);
            if ptr == 0 {
                return;
            }
            if ptr == offset {
                self.set_ext_next(cursor, next);
                return;
            }
            cursor = ptr;
        }
    }

    fn set_ext_next(&mut self, offset: u16, next: u16) {
        let header = self.read_u32(offset);
        self.write_u32(offset, (header & 0x000f_ffff) | (u32::from(next) << 20));
    }

    /// Offsets of the standard capabilities, in list order.
    pub fn walk_standard(&self) -> Vec<u16> {
        let mut offsets = Vec::new();
        if self.read_u16(PCI_STATUS) & PCI_STATUS_CAP_LIST == 0 {
            return offsets;
        }
        let mut ptr = u16::from(self.read_u8(PCI_CAPABILITY_LIST));
        while ptr >= PCI_HEADER_END && offsets.len() < MAX_CAPABILITY_CHAIN {
            offsets.push(ptr);
            ptr = u16::from(self.read_u8(ptr + 1));
        }
        offsets
    }

    /// Offsets of the extended capabilities, in list order. Null headers are skipped.
    pub fn walk_extended(&self) -> Vec<u16> {
        let mut offsets = Vec::new();
        let mut ptr = PCI_CONFIG_SPACE_SIZE;
        for _ in 0..MAX_CAPABILITY_CHAIN {
            let header = self.read_u32(ptr);
            if header == 0 {
                break;
            }
            if header & 0xffff != 0 {
                offsets.push(ptr);
            }
            let next = ext_next(header);
            if next < PCI_CONFIG_SPACE_SIZE || next == ptr {
                break;
            }
            ptr = next;
        }
        offsets
    }
}

impl std::fmt::Debug for ConfigSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpace")
            .field("function", &self.function)
            .field("claims", &self.claims)
            .finish()
    }
}

/// Extended capability header: id | version << 16 | next << 20.
pub fn ext_header(id: u16, version: u8, next: u16) -> u32 {
    u32::from(id) | (u32::from(version & 0xf) << 16) | (u32::from(next & 0xffc) << 20)
}

/// Next pointer of an extended capability header.
pub fn ext_next(header: u32) -> u16 {
    ((header >> 20) & 0xffc) as u16
}
