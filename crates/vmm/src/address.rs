//! Address types for physical and virtual memory.
//!
//! Physical addresses are frame addresses as the MMU sees them. Virtual addresses are
//! always x86_64 canonical addresses, including under software emulation, where they are
//! plain numbers that are never dereferenced by the host.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory from the kernel.
///
/// This enum supports two modes:
/// - Hardware: physical memory is reachable through the direct map at a fixed offset
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `pages` physical frames.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(pages: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(pages))
    }

    /// Sets the global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().unwrap_or_else(|| {
            panic!("address translator not set; call AddressTranslator::set_current during initialization")
        })
    }

    /// Returns the current address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: each thread owns its translator, it is never replaced once
                    // set, and it lives as long as the thread that reads it.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a typed pointer the kernel can dereference.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()) as *mut T,
        }
    }

    /// Returns the emulated memory backing this translator, if any.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(mem) => Some(mem),
        }
    }
}

/// Global address translator.
///
/// In test/software-emulation mode this is thread-local, so every test owns its own
/// emulated physical memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Shared representation and arithmetic of both address kinds.
macro_rules! address_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// `align` must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Rounds down to a multiple of `align`, a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            /// Panics if the result leaves the valid range.
            #[inline]
            fn add(self, bytes: usize) -> Self {
                Self::new(self.0 + bytes)
            }
        }

        /// Distance in bytes.
        impl Sub for $name {
            type Output = usize;

            #[inline]
            fn sub(self, other: Self) -> usize {
                self.0 - other.0
            }
        }
    };
}

address_type!(
    PhysicalAddress,
    "Address of a byte of physical memory, at most 52 bits wide."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if `addr` does not fit in a page table entry.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }
}

address_type!(
    VirtualAddress,
    "A canonical x86_64 virtual address: bits 48-63 repeat bit 47."
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns `None` for addresses in the non-canonical hole.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }
}
