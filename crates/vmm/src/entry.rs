//! Page table entries and levels.

use core::fmt;

use x86_64::structures::paging::PageTableFlags;

use crate::PhysicalAddress;

/// Flags of an entry pointing at an intermediate table.
///
/// Permissions are decided by the leaf, so intermediate tables allow everything.
pub const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Flags of the kernel's own upper-half root entries.
pub const KERNEL_ROOT_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

/// Software bit marking a leaf whose frame is a private copy.
pub const COPIED: PageTableFlags = PageTableFlags::BIT_9;

/// A single 64-bit page table entry, in the hardware format.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 hold the physical address.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// The empty (not present) entry.
    pub const EMPTY: Self = Self(0);

    /// Creates an entry pointing at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the address is not page aligned.
    pub fn new(address: PhysicalAddress, flags: PageTableFlags) -> Self {
        assert!(
            address.as_u64() & !Self::ADDRESS_MASK == 0,
            "physical address must be page-aligned"
        );
        Self(address.as_u64() | (flags.bits() & !Self::ADDRESS_MASK))
    }

    /// Returns the physical address stored in this entry, if it is present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present().then(|| self.frame())
    }

    /// Returns the address bits regardless of the present bit.
    pub fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    /// Returns the flag bits of this entry.
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_retain(self.0 & !Self::ADDRESS_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }

    /// Returns whether the leaf's frame is a private copy.
    pub fn is_copied(self) -> bool {
        self.flags().contains(COPIED)
    }

    /// Returns the raw value of this entry.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for PageEntry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#x}, {:?})", self.0 & Self::ADDRESS_MASK, self.flags())
    }
}

/// One level of the 4-level hierarchy.
///
/// Entries at a level are addressed by a global index: the virtual address (masked to 48
/// bits) shifted right by the level's shift, so the L1 entry of a page is its page number
/// and L4 entries are indexed 0..512.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    L1 = 0,
    L2 = 1,
    L3 = 2,
    L4 = 3,
}

impl Level {
    /// Returns the number of address bits below this level's index.
    pub const fn shift(self) -> usize {
        12 + 9 * self as usize
    }

    /// Returns the number of bytes mapped by one entry at this level.
    pub const fn span(self) -> usize {
        1 << self.shift()
    }

    /// Returns the global index of the entry covering `address`.
    pub const fn index_of(self, address: usize) -> usize {
        (address & 0x0000_FFFF_FFFF_F000) >> self.shift()
    }

    /// Returns the level whose table holds this level's tables.
    pub const fn parent(self) -> Option<Level> {
        match self {
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => Some(Level::L4),
            Level::L4 => None,
        }
    }

    /// Returns the level of the tables this level's entries point at.
    pub const fn child(self) -> Option<Level> {
        match self {
            Level::L1 => None,
            Level::L2 => Some(Level::L1),
            Level::L3 => Some(Level::L2),
            Level::L4 => Some(Level::L3),
        }
    }
}
