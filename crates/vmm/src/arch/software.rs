//! Software emulation for testing and development.
//!
//! Physical memory is a page-aligned host buffer, and every host thread acts as one
//! emulated processor with its own CR3 and a log of the TLB invalidations it performed.

use core::cell::RefCell;
use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::vec::Vec;

use super::PAGE_SIZE;
use crate::{PhysicalAddress, VirtualAddress};

/// A TLB invalidation performed by an emulated processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Page(VirtualAddress),
    All,
}

#[derive(Default)]
struct EmulatedCpu {
    root: Option<PhysicalAddress>,
    invalidations: Vec<Invalidation>,
}

std::thread_local! {
    static CPU: RefCell<EmulatedCpu> = RefCell::new(EmulatedCpu::default());
}

pub fn invalidate_page(address: VirtualAddress) {
    CPU.with(|cpu| cpu.borrow_mut().invalidations.push(Invalidation::Page(address)));
}

pub fn invalidate_all() {
    CPU.with(|cpu| cpu.borrow_mut().invalidations.push(Invalidation::All));
}

pub fn current_root() -> Option<PhysicalAddress> {
    CPU.with(|cpu| cpu.borrow().root)
}

pub unsafe fn load_root(root: PhysicalAddress) {
    CPU.with(|cpu| cpu.borrow_mut().root = Some(root));
}

/// Drains the invalidations the calling thread's emulated processor has performed.
pub fn take_invalidations() -> Vec<Invalidation> {
    CPU.with(|cpu| core::mem::take(&mut cpu.borrow_mut().invalidations))
}

/// Emulated physical memory.
///
/// Frame `n` lives at physical address `n * PAGE_SIZE`. The buffer is page aligned so that
/// page table entries can be accessed atomically, exactly as through the direct map.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    pages: usize,
}

// SAFETY: the buffer is only reached through raw pointers whose users synchronise through
// atomics or the owning space's mutex, like real physical memory.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a zeroed emulated memory of `pages` frames.
    pub fn new(pages: usize) -> Self {
        assert!(pages > 0, "emulated memory must hold at least one frame");
        let layout = Self::layout(pages);
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { base, pages }
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .unwrap_or_else(|_| panic!("emulated memory of {pages} frames is too large"))
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the number of frames.
    pub fn frames(&self) -> usize {
        self.pages
    }

    /// Returns the size of the emulated memory region in bytes.
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.pages)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_page_aligned_and_zeroed() {
        let mem = EmulatedMemory::new(4);
        let ptr = mem.translate(PAGE_SIZE);
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        assert_eq!(unsafe { *ptr }, 0);
        assert_eq!(mem.size(), 4 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn translate_out_of_bounds() {
        EmulatedMemory::new(1).translate(PAGE_SIZE);
    }

    #[test]
    fn invalidations_are_per_thread() {
        take_invalidations();
        invalidate_page(VirtualAddress::new(0x1000));
        std::thread::spawn(|| {
            invalidate_all();
            assert_eq!(take_invalidations(), [Invalidation::All]);
        })
        .join()
        .unwrap();
        assert_eq!(
            take_invalidations(),
            [Invalidation::Page(VirtualAddress::new(0x1000))]
        );
    }
}
