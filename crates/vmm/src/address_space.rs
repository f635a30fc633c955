//! Address space lifecycle.
//!
//! One kernel space owns the upper half. Every user space copies the kernel's upper-half
//! root entries by value when it is created; since the kernel pre-populates all of its L3
//! tables at boot, those entries never change afterwards and every space sees the same
//! kernel mappings.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    AllocFlags, PhysicalAddress, PhysicalAllocator, TableView, TlbInvalidator, VirtualAddress,
    arch,
    entry::{KERNEL_ROOT_FLAGS, Level, PageEntry},
    layout::{KERNEL_HALF_SLOT, RECURSIVE_SLOT},
    page_tables::{self, MapError, MapFlags, MapOutcome, PageTables, SpaceKind, UnmapOptions},
};

/// A virtual address space: one root table and everything reachable from it.
pub struct AddressSpace {
    kind: SpaceKind,
    root: PhysicalAddress,
    tables: spin::Mutex<PageTables>,
    /// Number of processors that have this space loaded.
    active: AtomicUsize,
}

impl AddressSpace {
    /// Builds the kernel space.
    ///
    /// Every upper-half root slot except the recursive one gets an empty L3 table, so the
    /// root's upper half is final before any user space copies it.
    pub fn new_kernel(allocator: &dyn PhysicalAllocator) -> Result<Self, MapError> {
        let kernel_slots = (KERNEL_HALF_SLOT..512).filter(|&slot| slot != RECURSIVE_SLOT);
        if !allocator.commit(kernel_slots.clone().count() + 1) {
            return Err(MapError::OutOfMemory);
        }

        let Some(root) = allocator.allocate(AllocFlags::ZEROED) else {
            allocator.decommit(kernel_slots.count() + 1);
            return Err(MapError::OutOfMemory);
        };
        let mut tables = PageTables::new(SpaceKind::Kernel, root);
        let view = tables.view();

        for slot in kernel_slots.clone() {
            let base = VirtualAddress::new(0xFFFF_0000_0000_0000 | (slot << Level::L4.shift()));
            let Some(l3) = allocator.allocate(AllocFlags::ZEROED) else {
                log::warn!("out of memory preallocating kernel L3 table for slot {slot}");
                for filled in kernel_slots.clone().take_while(|&filled| filled < slot) {
                    if let Some(frame) = view.entry(Level::L4, filled).address() {
                        allocator.free(frame);
                    }
                }
                allocator.free(root);
                allocator.decommit(kernel_slots.count() + 1);
                return Err(MapError::OutOfMemory);
            };
            view.store(Level::L4, slot, PageEntry::new(l3, KERNEL_ROOT_FLAGS));
            tables.adopt_table(Level::L3, base);
        }
        view.store(Level::L4, RECURSIVE_SLOT, PageEntry::new(root, KERNEL_ROOT_FLAGS));

        log::debug!("kernel address space at {root} ({} L3 tables)", tables.tables_active());
        Ok(Self::from_tables(SpaceKind::Kernel, root, tables))
    }

    /// Creates an empty user space sharing the kernel's upper half.
    pub fn new_user(
        kernel: &AddressSpace,
        allocator: &dyn PhysicalAllocator,
    ) -> Result<Self, MapError> {
        assert_eq!(kernel.kind, SpaceKind::Kernel, "user spaces copy the kernel space");

        if !allocator.commit(1) {
            return Err(MapError::OutOfMemory);
        }
        let Some(root) = allocator.allocate(AllocFlags::empty()) else {
            allocator.decommit(1);
            return Err(MapError::OutOfMemory);
        };

        let view = TableView::new(root);
        let kernel_view = kernel.table_view();
        for slot in 0..KERNEL_HALF_SLOT {
            view.store(Level::L4, slot, PageEntry::EMPTY);
        }
        for slot in KERNEL_HALF_SLOT..512 {
            view.store(Level::L4, slot, kernel_view.entry(Level::L4, slot));
        }
        view.store(Level::L4, RECURSIVE_SLOT, PageEntry::new(root, KERNEL_ROOT_FLAGS));

        log::debug!("user address space at {root}");
        Ok(Self::from_tables(
            SpaceKind::User,
            root,
            PageTables::new(SpaceKind::User, root),
        ))
    }

    /// Creates a user space with the same lower-half translations as `self`.
    ///
    /// The child gets its own tables; leaf frames are shared. Later changes to either
    /// space's tables do not affect the other.
    pub fn fork(
        &self,
        kernel: &AddressSpace,
        allocator: &dyn PhysicalAllocator,
    ) -> Result<Self, MapError> {
        assert_eq!(self.kind, SpaceKind::User, "only user spaces can be forked");
        let child = Self::new_user(kernel, allocator)?;
        match self.copy_lower_half(&child, allocator) {
            Ok(pages) => {
                log::debug!("forked {} into {} ({pages} pages)", self.root, child.root);
                Ok(child)
            }
            Err(error) => {
                child.destroy(allocator).finalize(allocator);
                Err(error)
            }
        }
    }

    fn copy_lower_half(
        &self,
        child: &AddressSpace,
        allocator: &dyn PhysicalAllocator,
    ) -> Result<usize, MapError> {
        let parent = self.tables.lock();
        let view = parent.view();
        let mut tables = child.tables.lock();
        for l4 in 0..KERNEL_HALF_SLOT {
            if !view.entry(Level::L4, l4).is_present() {
                continue;
            }
            for l3 in l4 * 512..(l4 + 1) * 512 {
                if !view.entry(Level::L3, l3).is_present() {
                    continue;
                }
                for l2 in l3 * 512..(l3 + 1) * 512 {
                    if !view.entry(Level::L2, l2).is_present() {
                        continue;
                    }
                    for l1 in l2 * 512..(l2 + 1) * 512 {
                        let leaf = view.entry(Level::L1, l1);
                        if leaf.is_present() {
                            let virt = VirtualAddress::new(l1 << Level::L1.shift());
                            tables.copy_leaf(allocator, virt, leaf)?;
                        }
                    }
                }
            }
        }
        Ok(tables.pages_mapped())
    }

    fn from_tables(kind: SpaceKind, root: PhysicalAddress, tables: PageTables) -> Self {
        Self {
            kind,
            root,
            tables: spin::Mutex::new(tables),
            active: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns the physical address of the root table (the value loaded into CR3).
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Returns a lock-free view of this space's tables.
    pub fn table_view(&self) -> TableView {
        TableView::new(self.root)
    }

    /// Locks the space's tables for mutation.
    pub fn lock(&self) -> spin::MutexGuard<'_, PageTables> {
        self.tables.lock()
    }

    /// See [`PageTables::map_page`].
    pub fn map_page(
        &self,
        allocator: &dyn PhysicalAllocator,
        physical: PhysicalAddress,
        virt: VirtualAddress,
        flags: MapFlags,
    ) -> Result<MapOutcome, MapError> {
        self.tables.lock().map_page(allocator, physical, virt, flags)
    }

    /// See [`PageTables::unmap_pages`].
    pub fn unmap_pages(
        &self,
        allocator: &dyn PhysicalAllocator,
        tlb: &dyn TlbInvalidator,
        start: VirtualAddress,
        count: usize,
        options: UnmapOptions,
    ) -> Result<(), MapError> {
        self.tables
            .lock()
            .unmap_pages(allocator, tlb, start, count, options)
    }

    /// See [`PageTables::ensure_committed`].
    pub fn ensure_committed(
        &self,
        allocator: &dyn PhysicalAllocator,
        start: VirtualAddress,
        pages: usize,
    ) -> Result<usize, MapError> {
        self.tables.lock().ensure_committed(allocator, start, pages)
    }

    /// Returns the frame `virt` is mapped to, without taking the space's mutex.
    ///
    /// A concurrent unmap may or may not be observed; hold [`AddressSpace::lock`] to rule
    /// that out.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        page_tables::translate(self.table_view(), virt, false)
    }

    /// Like [`AddressSpace::translate`], but only returns writable translations.
    pub fn translate_for_write(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        page_tables::translate(self.table_view(), virt, true)
    }

    /// Loads this space on the calling processor.
    ///
    /// # Safety
    ///
    /// The caller must be switching the processor to a thread of this space, and must
    /// call [`AddressSpace::deactivate`] when switching away.
    pub unsafe fn activate(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the upper half of every root maps the kernel.
        unsafe { arch::load_root(self.root) };
    }

    /// Records that the calling processor no longer runs this space.
    pub fn deactivate(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        assert!(previous != 0, "space {} deactivated more often than activated", self.root);
    }

    /// Returns true if any processor has this space loaded.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// First phase of destruction: frees every intermediate table and the commit budget.
    ///
    /// Leaf frames belong to the memory manager and must already be unmapped. The root is
    /// returned as a [`DestroyedSpace`] so it can be freed from another space.
    ///
    /// # Panics
    ///
    /// Panics if the space is still active on a processor, if it is the kernel space, or if
    /// the table graph and the active-table counter disagree.
    pub fn destroy(self, allocator: &dyn PhysicalAllocator) -> DestroyedSpace {
        assert_eq!(self.kind, SpaceKind::User, "the kernel space cannot be destroyed");
        if self.is_active() {
            panic!("destroying space {} while it is active", self.root);
        }
        self.tables.into_inner().free_tables(allocator);
        log::debug!("freed the page tables of space {}", self.root);
        DestroyedSpace { root: self.root }
    }
}

/// A space whose tables are gone but whose root table is still allocated.
#[must_use = "the root table leaks unless the space is finalized"]
pub struct DestroyedSpace {
    root: PhysicalAddress,
}

impl DestroyedSpace {
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Second phase of destruction: frees the root table.
    ///
    /// # Panics
    ///
    /// Panics if the calling processor still has this root loaded.
    pub fn finalize(self, allocator: &dyn PhysicalAllocator) {
        if arch::current_root() == Some(self.root) {
            panic!("finalizing space {} while it is the current space", self.root);
        }
        allocator.free(self.root);
        allocator.decommit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LocalInvalidator, PAGE_SIZE,
        layout::KERNEL_SPACE_START,
        testing::{EmulatedFrameAllocator, setup},
    };

    const USER_PAGE: usize = 0x1000_0000;

    fn kernel(alloc: &EmulatedFrameAllocator) -> AddressSpace {
        AddressSpace::new_kernel(alloc).unwrap()
    }

    fn frame(alloc: &EmulatedFrameAllocator) -> PhysicalAddress {
        alloc.allocate(AllocFlags::ZEROED).unwrap()
    }

    #[test]
    fn kernel_space_preallocates_upper_half() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let view = kernel.table_view();

        assert_eq!(kernel.lock().tables_active(), 255);
        assert_eq!(alloc.committed(), 256);
        assert!(!view.entry(Level::L4, 255).is_present());
        assert_eq!(view.entry(Level::L4, 256).flags().bits(), 3);
        assert_eq!(view.entry(Level::L4, RECURSIVE_SLOT).address(), Some(kernel.root()));
    }

    #[test]
    fn kernel_space_creation_fails_cleanly_without_frames() {
        setup();
        let alloc = EmulatedFrameAllocator::with_frame_limit(100);
        assert_eq!(AddressSpace::new_kernel(&alloc).err(), Some(MapError::OutOfMemory));
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(alloc.committed(), 0);
    }

    #[test]
    fn user_space_shares_kernel_half() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();

        // Kernel mappings made after the user space exists are visible through it.
        let phys = frame(&alloc);
        let virt = VirtualAddress::new(KERNEL_SPACE_START);
        kernel.map_page(&alloc, phys, virt, MapFlags::empty()).unwrap();
        assert_eq!(user.translate(virt), Some(phys));

        let view = user.table_view();
        assert_eq!(view.entry(Level::L4, RECURSIVE_SLOT).address(), Some(user.root()));
        assert_eq!(
            view.entry(Level::L4, 511),
            kernel.table_view().entry(Level::L4, 511)
        );
        assert!(
            (0..KERNEL_HALF_SLOT).all(|slot| !view.entry(Level::L4, slot).is_present())
        );
    }

    #[test]
    fn user_space_creation_needs_budget() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        alloc.set_commit_limit(alloc.committed());
        assert!(matches!(
            AddressSpace::new_user(&kernel, &alloc),
            Err(MapError::OutOfMemory)
        ));
    }

    #[test]
    fn destroy_returns_every_table() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let baseline = (alloc.in_use(), alloc.committed());

        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();
        let data = [frame(&alloc), frame(&alloc)];
        user.map_page(&alloc, data[0], VirtualAddress::new(USER_PAGE), MapFlags::USER)
            .unwrap();
        user.map_page(&alloc, data[1], VirtualAddress::new(0x7F00_0000_0000), MapFlags::USER)
            .unwrap();
        assert_eq!(user.lock().tables_active(), 6);
        user.unmap_pages(
            &alloc,
            &LocalInvalidator,
            VirtualAddress::new(USER_PAGE),
            1,
            UnmapOptions::FREE,
        )
        .unwrap();
        user.unmap_pages(
            &alloc,
            &LocalInvalidator,
            VirtualAddress::new(0x7F00_0000_0000),
            1,
            UnmapOptions::FREE,
        )
        .unwrap();

        let destroyed = user.destroy(&alloc);
        destroyed.finalize(&alloc);
        assert_eq!((alloc.in_use(), alloc.committed()), baseline);
    }

    #[test]
    #[should_panic(expected = "page tables active")]
    fn destroy_detects_orphaned_tables() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();
        user.map_page(&alloc, frame(&alloc), VirtualAddress::new(USER_PAGE), MapFlags::USER)
            .unwrap();

        // Unlink the L2 table behind the counters' back.
        let l3_index = Level::L3.index_of(USER_PAGE);
        user.table_view().store(Level::L3, l3_index, PageEntry::EMPTY);
        let _ = user.destroy(&alloc);
    }

    #[test]
    #[should_panic(expected = "while it is active")]
    fn destroy_refuses_active_space() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();
        unsafe { user.activate() };
        let _ = user.destroy(&alloc);
    }

    #[test]
    #[should_panic(expected = "while it is the current space")]
    fn finalize_refuses_current_root() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();
        unsafe { user.activate() };
        user.deactivate();
        // Still loaded in CR3 of this processor.
        user.destroy(&alloc).finalize(&alloc);
    }

    #[test]
    fn finalize_after_switching_away() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let user = AddressSpace::new_user(&kernel, &alloc).unwrap();
        unsafe { user.activate() };
        user.deactivate();
        unsafe { kernel.activate() };

        let root = user.root();
        user.destroy(&alloc).finalize(&alloc);
        assert_eq!(alloc.allocate(AllocFlags::empty()), Some(root));
    }

    #[test]
    fn fork_is_independent() {
        setup();
        let alloc = EmulatedFrameAllocator::new();
        let kernel = kernel(&alloc);
        let parent = AddressSpace::new_user(&kernel, &alloc).unwrap();
        let virt = VirtualAddress::new(USER_PAGE);
        let original = frame(&alloc);
        parent
            .map_page(&alloc, original, virt, MapFlags::USER | MapFlags::READ_ONLY)
            .unwrap();

        let child = parent.fork(&kernel, &alloc).unwrap();
        assert_eq!(child.translate(virt), Some(original));
        assert_eq!(child.lock().tables_active(), 3);

        // Replace the parent's translation.
        let replacement = frame(&alloc);
        parent
            .map_page(&alloc, replacement, virt, MapFlags::USER | MapFlags::OVERWRITE)
            .unwrap();
        parent
            .map_page(&alloc, frame(&alloc), virt + PAGE_SIZE, MapFlags::USER)
            .unwrap();

        assert_eq!(parent.translate(virt), Some(replacement));
        assert_eq!(child.translate(virt), Some(original));
        assert_eq!(child.translate(virt + PAGE_SIZE), None);
        assert_eq!(child.translate_for_write(virt), None);
    }
}
