//! The physical page allocator this layer draws page table frames from.

use bitflags::bitflags;

use crate::PhysicalAddress;

bitflags! {
    /// Options for [`PhysicalAllocator::allocate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Fill the frame with zeroes before returning it.
        const ZEROED = 1 << 0;
    }
}

/// Physical frame allocator with a commit budget.
///
/// Committing reserves frames without choosing them, so that a later `allocate` covered
/// by the reservation cannot run out of memory.
pub trait PhysicalAllocator: Sync {
    /// Allocates one frame.
    fn allocate(&self, flags: AllocFlags) -> Option<PhysicalAddress>;

    /// Returns a frame to the allocator.
    fn free(&self, frame: PhysicalAddress);

    /// Reserves `pages` frames from the commit budget, returning false if the budget
    /// cannot cover them.
    fn commit(&self, pages: usize) -> bool;

    /// Releases `pages` frames of previously committed budget.
    fn decommit(&self, pages: usize);
}
