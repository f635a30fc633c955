//! Page table management for one address space.
//!
//! [`PageTables`] owns the table graph below one root: it maps and unmaps leaf pages,
//! commits and links intermediate tables on demand, and keeps the counters that tie the
//! graph to the commit budget.

use alloc::vec::Vec;

use bitflags::bitflags;
use x86_64::structures::paging::PageTableFlags;

use crate::{
    AllocFlags, PAGE_SIZE, PhysicalAddress, PhysicalAllocator, TableView, TlbInvalidator,
    VirtualAddress, arch,
    commit::{CommitTracker, tables_covering},
    entry::{COPIED, Level, PageEntry, TABLE_FLAGS},
    layout::Window,
};

bitflags! {
    /// Options for [`PageTables::map_page`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Uncached (PWT and PCD).
        const NOT_CACHEABLE = 1 << 0;
        /// Reachable from user mode.
        const USER = 1 << 1;
        /// Replace an existing translation.
        const OVERWRITE = 1 << 2;
        /// Write-combining, through the PAT slot selected by PCD alone.
        const WRITE_COMBINING = 1 << 3;
        const READ_ONLY = 1 << 4;
        /// The frame is a private copy, see [`UnmapOptions::FREE_COPIED`].
        const COPIED = 1 << 5;
        /// Every intermediate table must already exist.
        const NO_NEW_TABLES = 1 << 6;
        /// Leave an existing translation alone instead of treating it as a conflict.
        const IGNORE_IF_MAPPED = 1 << 7;
    }

    /// Options for [`PageTables::unmap_pages`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnmapOptions: u32 {
        /// Free every unmapped frame.
        const FREE = 1 << 0;
        /// Free only frames mapped with [`MapFlags::COPIED`].
        const FREE_COPIED = 1 << 1;
    }
}

/// Which half of the address space a space may map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Result of a successful [`PageTables::map_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// A new translation was installed.
    Mapped,
    /// A translation existed and [`MapFlags::IGNORE_IF_MAPPED`] left it in place.
    AlreadyMapped,
    /// An existing translation was replaced. Other processors may still cache the old
    /// one until the caller shoots it down.
    Remapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The commit budget or the allocator could not supply an intermediate table.
    OutOfMemory,
    /// The address lies outside every mappable window.
    InvalidAddress,
    /// The address lies in the half owned by the other kind of space.
    WrongHalf,
}

/// The table graph of one address space, plus its commit state.
///
/// Mutation requires `&mut`, which the owning [`AddressSpace`](crate::AddressSpace) hands
/// out only under its mutex.
pub struct PageTables {
    kind: SpaceKind,
    view: TableView,
    commit: CommitTracker,
    /// Intermediate tables paid for from the commit budget.
    tables_committed: usize,
    /// Intermediate tables currently linked into the graph (the root is not counted).
    tables_active: usize,
    pages_mapped: usize,
}

impl PageTables {
    pub(crate) fn new(kind: SpaceKind, root: PhysicalAddress) -> Self {
        Self {
            kind,
            view: TableView::new(root),
            commit: CommitTracker::new(),
            tables_committed: 0,
            tables_active: 0,
            pages_mapped: 0,
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn view(&self) -> TableView {
        self.view
    }

    pub fn commit_tracker(&self) -> &CommitTracker {
        &self.commit
    }

    pub fn tables_committed(&self) -> usize {
        self.tables_committed
    }

    pub fn tables_active(&self) -> usize {
        self.tables_active
    }

    pub fn pages_mapped(&self) -> usize {
        self.pages_mapped
    }

    /// Checks that `[address, address + pages)` may be mapped by this space.
    /// Returns the span of the entry covering `address` at the highest level where no
    /// table exists below it, or `None` if the L1 table for `address` is present.
    fn unmapped_span(&self, address: usize) -> Option<usize> {
        [Level::L4, Level::L3, Level::L2]
            .into_iter()
            .find(|&level| !self.view.entry(level, level.index_of(address)).is_present())
            .map(Level::span)
    }

    pub fn check_range(&self, address: VirtualAddress, pages: usize) -> Result<Window, MapError> {
        let window = match Window::containing(address) {
            None | Some(Window::NullGuard) => return Err(MapError::InvalidAddress),
            Some(window) => window,
        };
        if window.is_kernel() != (self.kind == SpaceKind::Kernel) {
            return Err(MapError::WrongHalf);
        }
        if !window.contains_range(address, pages) {
            return Err(MapError::InvalidAddress);
        }
        Ok(window)
    }

    /// Makes sure every intermediate table the range needs exists.
    ///
    /// The missing tables are counted first and reserved from the commit budget in one
    /// batch; nothing is allocated or marked unless the reservation succeeds. Returns the
    /// number of tables created.
    pub fn ensure_committed(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        start: VirtualAddress,
        pages: usize,
    ) -> Result<usize, MapError> {
        assert!(start.is_aligned(PAGE_SIZE), "range start must be page-aligned");
        self.check_range(start, pages)?;
        self.commit_range(allocator, start, pages)
    }

    fn commit_range(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        start: VirtualAddress,
        pages: usize,
    ) -> Result<usize, MapError> {
        let needed = self.commit.missing(start, pages);
        if needed == 0 {
            return Ok(0);
        }
        if !allocator.commit(needed) {
            log::debug!("cannot commit {needed} page tables for {start} (+{pages} pages)");
            return Err(MapError::OutOfMemory);
        }
        self.tables_committed += needed;

        let mut used = 0;
        for table in [Level::L3, Level::L2, Level::L1] {
            for base in tables_covering(table, start, pages) {
                let base = VirtualAddress::new(base);
                if self.commit.is_committed(table, base) {
                    continue;
                }
                match self.install_table(allocator, table, base) {
                    Some(true) => used += 1,
                    Some(false) => {}
                    None => {
                        self.release(allocator, needed - used);
                        return Err(MapError::OutOfMemory);
                    }
                }
            }
        }
        self.release(allocator, needed - used);
        Ok(used)
    }

    /// Returns unused budget after a partial commit.
    fn release(&mut self, allocator: &dyn PhysicalAllocator, pages: usize) {
        if pages != 0 {
            allocator.decommit(pages);
            self.tables_committed -= pages;
        }
    }

    /// Links a zeroed `table`-level table covering `base` and marks it committed.
    ///
    /// Returns `Some(false)` if a table was already linked there (one set up before commit
    /// tracking existed), `None` if the allocator failed.
    fn install_table(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        table: Level,
        base: VirtualAddress,
    ) -> Option<bool> {
        let parent = table
            .parent()
            .unwrap_or_else(|| panic!("cannot install a root table"));
        let slot = parent.index_of(base.as_usize());

        if self.view.entry(parent, slot).is_present() {
            self.commit.mark(table, base);
            return Some(false);
        }

        let frame = allocator.allocate(AllocFlags::ZEROED)?;
        self.view.store(parent, slot, PageEntry::new(frame, TABLE_FLAGS));
        self.commit.mark(table, base);
        self.tables_active += 1;
        log::trace!("{table:?} table for {base} at {frame}");
        Some(true)
    }

    /// Installs or updates the translation of one page.
    ///
    /// Missing intermediate tables are committed and allocated first. If that fails the
    /// leaf entry is left untouched and `OutOfMemory` is returned.
    ///
    /// # Panics
    ///
    /// Panics on conflicting translations: an existing translation to another frame, an
    /// identical rewrite, or a flag change other than read-only to writable, unless
    /// `OVERWRITE` or `IGNORE_IF_MAPPED` is given. Panics if `NO_NEW_TABLES` is given and a
    /// table is missing.
    pub fn map_page(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        physical: PhysicalAddress,
        virt: VirtualAddress,
        flags: MapFlags,
    ) -> Result<MapOutcome, MapError> {
        assert!(physical.is_aligned(PAGE_SIZE), "physical address {physical} not page aligned");
        assert!(virt.is_aligned(PAGE_SIZE), "virtual address {virt} not page aligned");
        self.check_range(virt, 1)?;

        if flags.contains(MapFlags::NO_NEW_TABLES) {
            if self.commit.missing(virt, 1) != 0 {
                panic!("mapping {virt} with NO_NEW_TABLES, but a table is missing");
            }
        } else {
            self.commit_range(allocator, virt, 1)?;
        }

        let index = Level::L1.index_of(virt.as_usize());
        let old = self.view.entry(Level::L1, index);
        let value = self.leaf_entry(physical, flags);

        if old.is_present() && !flags.contains(MapFlags::OVERWRITE) {
            if flags.contains(MapFlags::IGNORE_IF_MAPPED) {
                return Ok(MapOutcome::AlreadyMapped);
            }
            if old.frame() != physical {
                panic!(
                    "attempt to map {virt} to {physical}, already mapped to {}",
                    old.frame()
                );
            }
            if old == value {
                panic!("attempt to rewrite page translation of {virt} ({old:?})");
            }
            if old.is_writable() || !value.is_writable() {
                panic!("attempt to change flags mapping {virt} from {old:?} to {value:?}");
            }
        }

        self.view.store(Level::L1, index, value);
        if old.is_present() {
            arch::invalidate_page(virt);
            Ok(MapOutcome::Remapped)
        } else {
            self.pages_mapped += 1;
            log::trace!("mapped {virt} -> {physical}");
            Ok(MapOutcome::Mapped)
        }
    }

    fn leaf_entry(&self, physical: PhysicalAddress, flags: MapFlags) -> PageEntry {
        let mut bits = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if flags.contains(MapFlags::WRITE_COMBINING) {
            bits |= PageTableFlags::NO_CACHE;
        }
        if flags.contains(MapFlags::NOT_CACHEABLE) {
            bits |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
        }
        if flags.contains(MapFlags::USER) {
            bits |= PageTableFlags::USER_ACCESSIBLE;
        } else {
            bits |= PageTableFlags::GLOBAL;
        }
        if flags.contains(MapFlags::READ_ONLY) {
            bits.remove(PageTableFlags::WRITABLE);
        }
        if flags.contains(MapFlags::COPIED) {
            bits |= COPIED;
        }
        // Pre-set so the MMU never writes back into an entry that is being unmapped.
        bits |= PageTableFlags::ACCESSED | PageTableFlags::DIRTY;
        PageEntry::new(physical, bits)
    }

    /// Installs a leaf entry verbatim, committing tables as needed. Used when forking.
    pub(crate) fn copy_leaf(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        virt: VirtualAddress,
        leaf: PageEntry,
    ) -> Result<(), MapError> {
        self.check_range(virt, 1)?;
        self.commit_range(allocator, virt, 1)?;
        let index = Level::L1.index_of(virt.as_usize());
        if !self.view.swap(Level::L1, index, leaf).is_present() {
            self.pages_mapped += 1;
        }
        Ok(())
    }

    /// Removes the translations of `count` pages starting at `start`.
    ///
    /// Emptied intermediate tables stay in place. The range is invalidated through `tlb`
    /// before any frame is returned to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if a present leaf lacks the accessed or dirty bit, since every leaf is mapped
    /// with both set.
    pub fn unmap_pages(
        &mut self,
        allocator: &dyn PhysicalAllocator,
        tlb: &dyn TlbInvalidator,
        start: VirtualAddress,
        count: usize,
        options: UnmapOptions,
    ) -> Result<(), MapError> {
        assert!(start.is_aligned(PAGE_SIZE), "virtual address {start} not page aligned");
        self.check_range(start, count)?;

        let mut to_free = Vec::new();
        let mut page = 0;
        while page < count {
            let address = start.as_usize() + page * PAGE_SIZE;
            if let Some(span) = self.unmapped_span(address) {
                page += (span - address % span) / PAGE_SIZE;
                continue;
            }
            let index = Level::L1.index_of(address);
            let entry = self.view.entry(Level::L1, index);
            page += 1;
            if !entry.is_present() {
                continue;
            }

            if !entry
                .flags()
                .contains(PageTableFlags::ACCESSED | PageTableFlags::DIRTY)
            {
                panic!("page {address:#x} found without accessed or dirty bit set ({entry:?})");
            }

            self.view.store(Level::L1, index, PageEntry::EMPTY);
            self.pages_mapped -= 1;
            if options.contains(UnmapOptions::FREE)
                || (options.contains(UnmapOptions::FREE_COPIED) && entry.is_copied())
            {
                to_free.push(entry.frame());
            }
        }

        tlb.invalidate(start, count);
        for frame in to_free {
            allocator.free(frame);
        }
        Ok(())
    }

    /// Returns the frame `virt` is mapped to, if any.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        translate(self.view, virt, false)
    }

    /// Frees every intermediate table of the lower half and releases the commit budget.
    ///
    /// # Panics
    ///
    /// Panics if the number of tables freed does not match the active-table counter.
    pub(crate) fn free_tables(&mut self, allocator: &dyn PhysicalAllocator) {
        for l4 in 0..256 {
            let Some(l3_table) = self.view.entry(Level::L4, l4).address() else {
                continue;
            };
            for l3 in l4 * 512..(l4 + 1) * 512 {
                let Some(l2_table) = self.view.entry(Level::L3, l3).address() else {
                    continue;
                };
                for l2 in l3 * 512..(l3 + 1) * 512 {
                    if let Some(l1_table) = self.view.entry(Level::L2, l2).address() {
                        allocator.free(l1_table);
                        self.tables_active -= 1;
                    }
                }
                allocator.free(l2_table);
                self.tables_active -= 1;
            }
            allocator.free(l3_table);
            self.tables_active -= 1;
            self.view.store(Level::L4, l4, PageEntry::EMPTY);
        }

        if self.tables_active != 0 {
            panic!(
                "space {} still has {} page tables active",
                self.view.root(),
                self.tables_active
            );
        }
        if self.pages_mapped != 0 {
            log::warn!(
                "space {} destroyed with {} pages still mapped",
                self.view.root(),
                self.pages_mapped
            );
        }

        self.commit.clear();
        allocator.decommit(self.tables_committed);
        self.tables_committed = 0;
    }

    /// Counts tables created outside [`PageTables::install_table`] (kernel bootstrap).
    pub(crate) fn adopt_table(&mut self, table: Level, base: VirtualAddress) {
        if self.commit.mark(table, base) {
            self.tables_committed += 1;
            self.tables_active += 1;
        }
    }
}

/// Walks the tables under `view` without locking.
pub(crate) fn translate(
    view: TableView,
    virt: VirtualAddress,
    write_access: bool,
) -> Option<PhysicalAddress> {
    let entry = view.load(Level::L1, Level::L1.index_of(virt.as_usize()))?;
    if write_access && !entry.is_writable() {
        return None;
    }
    entry.address()
}
