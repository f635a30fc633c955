#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Essence Virtual Memory Manager (VMM)
//!
//! The architecture layer underneath the Essence memory manager. It provides:
//!
//! - 4-level x86_64 page tables with lazily committed intermediate tables.
//! - Address space creation, forking and two-phase teardown.
//! - Cross-processor TLB shootdown over inter-processor interrupts.
//! - Classification of page faults by the address window they hit.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod commit;
mod entry;
mod fault;
mod ipi;
pub mod layout;
mod page_tables;
mod physical;
mod shootdown;
mod table_view;

#[cfg(any(test, feature = "software-emulation"))]
pub mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, DestroyedSpace};
pub use commit::{CommitBitset, CommitTracker};
pub use entry::{Level, PageEntry};
pub use fault::{
    FaultClassifier, FaultFlags, FaultRequest, FaultingThread, MemoryManager, PageFaultError,
};
pub use ipi::{CALL_FUNCTION_IPI, IpiChannel, IpiGuard, IpiSender, TLB_SHOOTDOWN_IPI};
pub use layout::Window;
pub use page_tables::{MapError, MapFlags, MapOutcome, PageTables, SpaceKind, UnmapOptions};
pub use physical::{AllocFlags, PhysicalAllocator};
pub use shootdown::{
    FULL_FLUSH_THRESHOLD, LocalInvalidator, Shootdown, TlbInvalidator, TlbShootdown,
    handle_shootdown_ipi, ipi_channel, tlb_shootdown,
};
pub use table_view::TableView;

pub use arch::{
    ENTRIES_PER_TABLE, PAGE_SIZE, current_root, invalidate_all, invalidate_page, load_root,
};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, Invalidation, take_invalidations};
