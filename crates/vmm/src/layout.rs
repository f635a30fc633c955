//! The fixed virtual address windows of the Essence address space.
//!
//! Every address a space may map falls in exactly one window. Addresses outside all of
//! them (the non-canonical hole, the recursive table window, unassigned kernel ranges) are
//! rejected before any table walk.

use core::ops::Range;

use crate::{PAGE_SIZE, VirtualAddress};

/// Root slot that points back at the root table itself.
pub const RECURSIVE_SLOT: usize = 510;

/// First root slot of the kernel half.
pub const KERNEL_HALF_SLOT: usize = 256;

pub const USER_SPACE_START: usize = PAGE_SIZE;
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

pub const CORE_SPACE_START: usize = 0xFFFF_8001_0000_0000;
pub const CORE_SPACE_END: usize = 0xFFFF_8001_F000_0000;

/// Metadata of the core space (its region array), populated on demand.
pub const CORE_REGIONS_START: usize = 0xFFFF_8001_F000_0000;
pub const CORE_REGIONS_END: usize = 0xFFFF_8002_0000_0000;

pub const KERNEL_SPACE_START: usize = 0xFFFF_9000_0000_0000;
pub const KERNEL_SPACE_END: usize = 0xFFFF_F000_0000_0000;

/// Identity window over the first 4 GiB of physical memory, used for device IO.
pub const LOW_MEMORY_MAP_START: usize = 0xFFFF_FE00_0000_0000;
pub const LOW_MEMORY_LIMIT: usize = 0x1_0000_0000;

pub const KERNEL_IMAGE_START: usize = 0xFFFF_FFFF_8000_0000;
pub const KERNEL_IMAGE_END: usize = 0xFFFF_FFFF_9000_0000;

pub const MODULES_START: usize = 0xFFFF_FFFF_9000_0000;
pub const MODULES_END: usize = 0xFFFF_FFFF_C000_0000;

/// A named virtual address window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// The first page, never mapped.
    NullGuard,
    User,
    CoreSpace,
    CoreRegions,
    KernelSpace,
    LowMemory,
    KernelImage,
    Modules,
}

impl Window {
    const ALL: [Window; 8] = [
        Window::NullGuard,
        Window::User,
        Window::CoreSpace,
        Window::CoreRegions,
        Window::KernelSpace,
        Window::LowMemory,
        Window::KernelImage,
        Window::Modules,
    ];

    /// Returns the address range covered by this window.
    pub const fn range(self) -> Range<usize> {
        match self {
            Window::NullGuard => 0..PAGE_SIZE,
            Window::User => USER_SPACE_START..USER_SPACE_END,
            Window::CoreSpace => CORE_SPACE_START..CORE_SPACE_END,
            Window::CoreRegions => CORE_REGIONS_START..CORE_REGIONS_END,
            Window::KernelSpace => KERNEL_SPACE_START..KERNEL_SPACE_END,
            Window::LowMemory => LOW_MEMORY_MAP_START..LOW_MEMORY_MAP_START + LOW_MEMORY_LIMIT,
            Window::KernelImage => KERNEL_IMAGE_START..KERNEL_IMAGE_END,
            Window::Modules => MODULES_START..MODULES_END,
        }
    }

    /// Returns the window containing `address`, if any.
    pub fn containing(address: VirtualAddress) -> Option<Window> {
        let address = address.as_usize();
        Self::ALL
            .into_iter()
            .find(|window| window.range().contains(&address))
    }

    /// Returns true for windows in the kernel half.
    pub const fn is_kernel(self) -> bool {
        !matches!(self, Window::NullGuard | Window::User)
    }

    /// Returns true if `[address, address + pages * PAGE_SIZE)` lies inside this window.
    pub fn contains_range(self, address: VirtualAddress, pages: usize) -> bool {
        let range = self.range();
        let start = address.as_usize();
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| start.checked_add(bytes))
            .is_some_and(|end| start >= range.start && end <= range.end)
    }
}
