//! Architecture-specific primitives for memory management.
//!
//! The page table format is always x86_64's. What changes between hardware and software
//! emulation is how the current root is loaded and how TLB entries are invalidated.

use crate::{PhysicalAddress, VirtualAddress};

// NOTE: We include the hardware module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
use self::x86_64 as active;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedMemory, Invalidation, take_invalidations};
#[cfg(any(test, feature = "software-emulation"))]
use software as active;

/// Maximum number of bits in a physical address a page table entry can hold.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in every page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Physical addresses must fit in the entry's address field.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Virtual addresses must be canonical (bits 47-63 all equal).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

/// Invalidates the calling processor's TLB entry for one page.
#[inline]
pub fn invalidate_page(address: VirtualAddress) {
    active::invalidate_page(address);
}

/// Invalidates every TLB entry on the calling processor, global pages included.
#[inline]
pub fn invalidate_all() {
    active::invalidate_all();
}

/// Returns the root table currently loaded on the calling processor.
#[inline]
pub fn current_root() -> Option<PhysicalAddress> {
    active::current_root()
}

/// Loads `root` as the calling processor's page table root.
///
/// # Safety
///
/// `root` must be a complete L4 table whose upper half maps the running kernel.
#[inline]
pub unsafe fn load_root(root: PhysicalAddress) {
    // SAFETY: forwarded to the caller.
    unsafe { active::load_root(root) }
}
