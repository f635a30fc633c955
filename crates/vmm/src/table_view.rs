//! Indexed access to the live page table graph of one address space.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    PhysicalAddress,
    address::AddressTranslator,
    entry::{Level, PageEntry},
};

/// A view over the tables reachable from one root, addressed by `(level, global index)`.
///
/// The global index of an entry is the virtual address it covers shifted by the level's
/// shift (see [`Level::index_of`]), the same numbering a recursive mapping exposes. Tables
/// are reached through the [`AddressTranslator`] rather than through the recursive slot,
/// so a view works on any space, current or not.
///
/// Entries are read and written with single aligned 64-bit atomic operations, so a
/// concurrent reader sees either the old or the new entry, never a torn one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableView {
    root: PhysicalAddress,
}

impl TableView {
    /// Creates a view over the table graph rooted at `root`.
    pub const fn new(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// Returns the physical address of the root (L4) table.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Loads an entry, or `None` if a table above it is not present.
    pub fn load(&self, level: Level, index: usize) -> Option<PageEntry> {
        self.slot(level, index)
            .map(|slot| PageEntry::from(slot.load(Ordering::Acquire)))
    }

    /// Loads an entry, treating a missing table as an empty entry.
    pub fn entry(&self, level: Level, index: usize) -> PageEntry {
        self.load(level, index).unwrap_or(PageEntry::EMPTY)
    }

    /// Stores an entry.
    ///
    /// # Panics
    ///
    /// Panics if a table above the entry is not present.
    pub fn store(&self, level: Level, index: usize, entry: PageEntry) {
        self.slot_or_panic(level, index)
            .store(entry.as_u64(), Ordering::Release);
    }

    /// Replaces an entry, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if a table above the entry is not present.
    pub fn swap(&self, level: Level, index: usize, entry: PageEntry) -> PageEntry {
        PageEntry::from(
            self.slot_or_panic(level, index)
                .swap(entry.as_u64(), Ordering::AcqRel),
        )
    }

    /// Returns the physical address of the table that holds entry `(level, index)`.
    pub fn table_of(&self, level: Level, index: usize) -> Option<PhysicalAddress> {
        match level.parent() {
            None => Some(self.root),
            Some(parent) => self.load(parent, index >> 9)?.address(),
        }
    }

    fn slot_or_panic(&self, level: Level, index: usize) -> &AtomicU64 {
        self.slot(level, index).unwrap_or_else(|| {
            panic!("no table holds the {level:?} entry {index:#x}")
        })
    }

    fn slot(&self, level: Level, index: usize) -> Option<&AtomicU64> {
        let limit = 1usize << (9 * (4 - level as usize));
        assert!(index < limit, "{level:?} index {index:#x} out of range");

        let table = self.table_of(level, index)?;
        let entries: *mut AtomicU64 = AddressTranslator::current().phys_to_ptr(table);
        // SAFETY: `table` is a present page table frame, so it holds 512 naturally aligned
        // entries that are only ever accessed atomically.
        Some(unsafe { &*entries.add(index % 512) })
    }
}
