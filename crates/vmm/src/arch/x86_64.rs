//! x86_64 hardware implementation.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags, Cr4, Cr4Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

#[allow(dead_code)]
pub fn invalidate_page(address: VirtualAddress) {
    tlb::flush(VirtAddr::new(address.as_u64()));
}

#[allow(dead_code)]
pub fn invalidate_all() {
    // Kernel pages are global, so reloading CR3 would leave them cached.
    let flags = Cr4::read();
    // SAFETY: only the global-page bit changes, and it is restored immediately.
    unsafe {
        Cr4::write(flags.difference(Cr4Flags::PAGE_GLOBAL));
        Cr4::write(flags);
    }
}

#[allow(dead_code)]
pub fn current_root() -> Option<PhysicalAddress> {
    let (frame, _) = Cr3::read();
    Some(PhysicalAddress::new(frame.start_address().as_u64() as usize))
}

#[allow(dead_code)]
pub unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
    // SAFETY: the caller guarantees the table maps the running kernel.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
