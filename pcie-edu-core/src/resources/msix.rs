//! MSI-X vector management.
//!
//! Each function owns one fixed-size vector table living in one of its BARs.
//! Vectors are reserved one by one during realize and released together on
//! teardown. An optional device-wide budget models the host's interrupt
//! routing capacity.

use super::region::RegionRegistry;
use crate::error::{EduError, Result};
use crate::observability::metrics;
use crate::types::FunctionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Architectural maximum table size.
pub const MSIX_MAX_VECTORS: u16 = 2048;

/// Size of one table entry in bytes.
pub const MSIX_ENTRY_SIZE: u64 = 16;

/// Handle to an initialized vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableHandle(u64);

impl TableHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One vector table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub index: u16,
    pub in_use: bool,
}

/// Vector table of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorTable {
    pub owner: FunctionId,
    pub bar_slot: u8,
    pub table_offset: u32,
    pub pba_offset: u32,
    pub entries: Vec<VectorEntry>,
}

impl VectorTable {
    pub fn vector_count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn in_use(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().filter(|e| e.in_use).map(|e| e.index)
    }

    fn in_use_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.in_use).count() as u32
    }
}

/// Bytes covered by the pending-bit array of a `count` vector table.
pub fn pba_size(count: u16) -> u64 {
    u64::from(count).div_ceil(64) * 8
}

/// Allocates MSI-X tables and tracks vector usage across a device.
#[derive(Debug, Default)]
pub struct VectorManager {
    tables: BTreeMap<TableHandle, VectorTable>,
    budget: Option<u32>,
    in_use_total: u32,
    next_handle: u64,
}

impl VectorManager {
    /// Manager without a device-wide vector budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that refuses to reserve more than `budget` vectors in total.
    pub fn with_budget(budget: u32) -> Self {
        info!("Creating MSI-X vector manager with budget {}", budget);
        Self { budget: Some(budget), ..Self::default() }
    }

    /// Initialize the vector table of `function`.
    ///
    /// The table and PBA live in BAR `bar_slot`, which must already be
    /// reserved in `regions`.
    ///
    /// # Errors
    ///
    /// - `BarMissing` if the backing region does not exist
    /// - `OffsetOverlap` if table and PBA overlap or fall outside the BAR
    /// - `ResourceExhausted` if `vector_count` exceeds the architectural maximum
    #[instrument(skip(self, regions), fields(function = %function))]
    pub fn init_table(
        &mut self,
        function: FunctionId,
        regions: &RegionRegistry,
        vector_count: u16,
        bar_slot: u8,
        table_offset: u32,
        pba_offset: u32,
    ) -> Result<TableHandle> {
        if vector_count == 0 || vector_count > MSIX_MAX_VECTORS {
            return Err(EduError::ResourceExhausted {
                resource: "msix table size",
                requested: u64::from(vector_count),
                limit: u64::from(MSIX_MAX_VECTORS),
            });
        }

        let region = regions
            .region_at(function, bar_slot)
            .ok_or(EduError::BarMissing { function, slot: bar_slot })?;

        let table_end = u64::from(table_offset) + u64::from(vector_count) * MSIX_ENTRY_SIZE;
        let table = (u64::from(table_offset), table_end);
        let pba = (u64::from(pba_offset), u64::from(pba_offset) + pba_size(vector_count));

        if table.0 < pba.1 && pba.0 < table.1 {
            return Err(EduError::OffsetOverlap {
                function,
                reason: format!(
                    "table {:#x}..{:#x} overlaps PBA {:#x}..{:#x}",
                    table.0, table.1, pba.0, pba.1
                ),
            });
        }
        if table.1 > region.size || pba.1 > region.size {
            return Err(EduError::OffsetOverlap {
                function,
                reason: format!(
                    "table or PBA extends past BAR {} ({:#x} bytes)",
                    bar_slot, region.size
                ),
            });
        }

        self.next_handle += 1;
        let handle = TableHandle(self.next_handle);
        self.tables.insert(
            handle,
            VectorTable {
                owner: function,
                bar_slot,
                table_offset,
                pba_offset,
                entries: (0..vector_count)
                    .map(|index| VectorEntry { index, in_use: false })
                    .collect(),
            },
        );

        info!(vectors = vector_count, bar = bar_slot, "Initialized MSI-X table");
        Ok(handle)
    }

    /// Mark vector `index` as used.
    ///
    /// # Errors
    ///
    /// `IndexOutOfRange`, `AlreadyInUse`, `UnknownTable`, or
    /// `ResourceExhausted` when the device budget is spent.
    pub fn use_vector(&mut self, handle: TableHandle, index: u16) -> Result<()> {
        let table =
            self.tables.get_mut(&handle).ok_or(EduError::UnknownTable { handle: handle.raw() })?;
        let function = table.owner;
        let count = table.vector_count();

        let entry = table
            .entries
            .get_mut(usize::from(index))
            .ok_or(EduError::IndexOutOfRange { function, index, count })?;
        if entry.in_use {
            return Err(EduError::AlreadyInUse { function, index });
        }

        if let Some(budget) = self.budget {
            if self.in_use_total >= budget {
                warn!(function = %function, index, budget, "MSI-X vector budget exhausted");
                return Err(EduError::ResourceExhausted {
                    resource: "msix vectors",
                    requested: u64::from(self.in_use_total) + 1,
                    limit: u64::from(budget),
                });
            }
        }

        entry.in_use = true;
        self.in_use_total += 1;
        metrics::set_vectors_in_use(self.in_use_total);
        debug!(function = %function, index, "MSI-X vector in use");
        Ok(())
    }

    /// Use vectors `0..count` of the table.
    ///
    /// On failure every vector reserved by this call is released again before
    /// the error is returned.
    #[instrument(skip(self))]
    pub fn use_all(&mut self, handle: TableHandle) -> Result<()> {
        let count = self
            .tables
            .get(&handle)
            .map(VectorTable::vector_count)
            .ok_or(EduError::UnknownTable { handle: handle.raw() })?;

        for index in 0..count {
            if let Err(e) = self.use_vector(handle, index) {
                for reserved in (0..index).rev() {
                    self.unuse_vector(handle, reserved);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release one vector. No-op if it is not in use.
    pub fn unuse_vector(&mut self, handle: TableHandle, index: u16) {
        let table = self.tables.get_mut(&handle);
        let Some(entry) = table.and_then(|t| t.entries.get_mut(usize::from(index))) else {
            return;
        };
        if entry.in_use {
            entry.in_use = false;
            self.in_use_total -= 1;
            metrics::set_vectors_in_use(self.in_use_total);
        }
    }

    /// Release every vector and drop the table. Idempotent and infallible.
    #[instrument(skip(self))]
    pub fn release_all(&mut self, handle: TableHandle) {
        match self.tables.remove(&handle) {
            Some(table) => {
                let released = table.in_use_count();
                self.in_use_total -= released;
                metrics::set_vectors_in_use(self.in_use_total);
                info!(function = %table.owner, released, "Released MSI-X table");
            }
            None => debug!(handle = handle.raw(), "MSI-X table already released"),
        }
    }

    pub fn table(&self, handle: TableHandle) -> Option<&VectorTable> {
        self.tables.get(&handle)
    }

    /// Indices of the vectors in use in `handle`; empty for unknown handles.
    pub fn vectors_in_use(&self, handle: TableHandle) -> Vec<u16> {
        self.tables.get(&handle).map(|t| t.in_use().collect()).unwrap_or_default()
    }

    /// Vectors in use across every table.
    pub fn total_in_use(&self) -> u32 {
        self.in_use_total
    }

    /// Number of live tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn budget(&self) -> Option<u32> {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::RegionKind;

    const PF: FunctionId = FunctionId::new(0);

    fn registry_with_msix_bar() -> RegionRegistry {
        let mut regions = RegionRegistry::new();
        regions.reserve(PF, 2, 16 * 1024, false, RegionKind::MsixWindow).unwrap();
        regions
    }

    #[test]
    fn test_init_and_use_all() {
        let regions = registry_with_msix_bar();
        let mut vectors = VectorManager::new();

        let handle = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x800).unwrap();
        vectors.use_all(handle).unwrap();

        assert_eq!(vectors.vectors_in_use(handle), vec![0, 1, 2, 3]);
        assert_eq!(vectors.total_in_use(), 4);
    }

    #[test]
    fn test_init_requires_bar() {
        let regions = RegionRegistry::new();
        let mut vectors = VectorManager::new();

        let err = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x800).unwrap_err();
        assert!(matches!(err, EduError::BarMissing { slot: 2, .. }));
        assert_eq!(vectors.table_count(), 0);
    }

    #[test]
    fn test_init_rejects_overlap() {
        let regions = registry_with_msix_bar();
        let mut vectors = VectorManager::new();

        // 4 vectors occupy 0x00..0x40; PBA at 0x20 collides
        let err = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x020).unwrap_err();
        assert!(matches!(err, EduError::OffsetOverlap { .. }));

        // PBA past the end of the 16 KiB window
        let err = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x4000).unwrap_err();
        assert!(matches!(err, EduError::OffsetOverlap { .. }));
    }

    #[test]
    fn test_use_vector_errors() {
        let regions = registry_with_msix_bar();
        let mut vectors = VectorManager::new();
        let handle = vectors.init_table(PF, &regions, 2, 2, 0x000, 0x800).unwrap();

        vectors.use_vector(handle, 0).unwrap();
        assert!(matches!(
            vectors.use_vector(handle, 0),
            Err(EduError::AlreadyInUse { index: 0, .. })
        ));
        assert!(matches!(
            vectors.use_vector(handle, 2),
            Err(EduError::IndexOutOfRange { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_budget_rolls_back_partial_use() {
        let regions = registry_with_msix_bar();
        let mut vectors = VectorManager::with_budget(3);
        let handle = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x800).unwrap();

        let err = vectors.use_all(handle).unwrap_err();
        assert!(err.is_recoverable());
        assert!(vectors.vectors_in_use(handle).is_empty());
        assert_eq!(vectors.total_in_use(), 0);
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let regions = registry_with_msix_bar();
        let mut vectors = VectorManager::new();
        let handle = vectors.init_table(PF, &regions, 4, 2, 0x000, 0x800).unwrap();
        vectors.use_all(handle).unwrap();

        vectors.release_all(handle);
        let after_once = (vectors.total_in_use(), vectors.table_count());
        vectors.release_all(handle);

        assert_eq!((vectors.total_in_use(), vectors.table_count()), after_once);
        assert_eq!(after_once, (0, 0));
        assert!(matches!(vectors.use_vector(handle, 0), Err(EduError::UnknownTable { .. })));
    }
}
