//! The saved state of a trapped context.

use core::mem::{offset_of, size_of};

use vmm::{FaultFlags, VirtualAddress};

use crate::Vector;

pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
/// User data comes before user code, the order `sysret` expects.
pub const USER_DATA_SELECTOR: u64 = 0x1B;
pub const USER_CODE_SELECTOR: u64 = 0x23;

/// Written by the entry stub, checked before returning.
pub const TRAP_CONTEXT_MAGIC: u64 = 0x0123_4567_89AB_CDEF;

const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;
const PAGE_FAULT_WRITE: u64 = 1 << 1;
/// A reserved bit was set in a paging structure.
const PAGE_FAULT_RESERVED: u64 = 1 << 3;

/// Which privilege level the trap came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    Supervisor,
    User,
}

/// Registers saved by the entry stub, lowest address first.
///
/// The layout is shared with the assembly in `arch::x86_64` and must not change without
/// updating it.
#[repr(C)]
#[derive(Clone)]
pub struct TrapContext {
    pub cr2: u64,
    pub ds: u64,
    /// `fxsave` image, with 16 bytes of slack so it can be aligned.
    pub fxsave: [u8; 512 + 16],
    pub magic: u64,
    pub cr8: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the processor.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = {
    assert!(size_of::<TrapContext>() == 736);
    assert!(offset_of!(TrapContext, cr2) == 0);
    assert!(offset_of!(TrapContext, ds) == 8);
    assert!(offset_of!(TrapContext, fxsave) == 16);
    assert!(offset_of!(TrapContext, magic) == 544);
    assert!(offset_of!(TrapContext, cr8) == 552);
    assert!(offset_of!(TrapContext, r15) == 560);
    assert!(offset_of!(TrapContext, rax) == 672);
    assert!(offset_of!(TrapContext, vector) == 680);
    assert!(offset_of!(TrapContext, error_code) == 688);
    assert!(offset_of!(TrapContext, rip) == 696);
    assert!(offset_of!(TrapContext, cs) == 704);
    assert!(offset_of!(TrapContext, ss) == 728);
};

impl TrapContext {
    /// Builds the context the entry stub would save for a trap at `rip`.
    ///
    /// Interrupts are recorded as enabled in the trapped context.
    pub fn new(vector: Vector, error_code: u64, mode: PrivilegeMode, rip: u64) -> Self {
        let (cs, ss) = match mode {
            PrivilegeMode::Supervisor => (KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR),
            PrivilegeMode::User => (USER_CODE_SELECTOR, USER_DATA_SELECTOR),
        };
        Self {
            cr2: 0,
            ds: ss,
            fxsave: [0; 512 + 16],
            magic: TRAP_CONTEXT_MAGIC,
            cr8: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: u64::from(vector.value()),
            error_code,
            rip,
            cs,
            rflags: RFLAGS_INTERRUPT_ENABLE | 0x2,
            rsp: 0,
            ss,
        }
    }

    pub fn vector(&self) -> Vector {
        Vector::new(self.vector as u8)
    }

    /// The privilege level is the low two bits of the saved code selector.
    pub fn mode(&self) -> PrivilegeMode {
        if self.cs & 3 == 0 {
            PrivilegeMode::Supervisor
        } else {
            PrivilegeMode::User
        }
    }

    pub fn interrupts_were_enabled(&self) -> bool {
        self.rflags & RFLAGS_INTERRUPT_ENABLE != 0
    }

    /// Flags describing a page fault, from its error code.
    pub fn fault_flags(&self) -> FaultFlags {
        let mut flags = FaultFlags::empty();
        if self.error_code & PAGE_FAULT_WRITE != 0 {
            flags |= FaultFlags::WRITE;
        }
        if self.mode() == PrivilegeMode::Supervisor {
            flags |= FaultFlags::FOR_SUPERVISOR;
        }
        flags
    }

    /// Returns true if the page fault was caused by a reserved bit in a table entry.
    pub fn is_reserved_bit_fault(&self) -> bool {
        self.error_code & PAGE_FAULT_RESERVED != 0
    }

    /// Checks that the context is still fit to return to.
    ///
    /// # Panics
    ///
    /// Panics if the magic value was overwritten, a selector is out of range, `rip` is not
    /// canonical, or a kernel code selector is paired with a user `rip`.
    pub fn sanity_check(&self) {
        if self.magic != TRAP_CONTEXT_MAGIC {
            panic!(
                "trap context corrupted: magic is {:#x} (vector {}, rip {:#x})",
                self.magic,
                self.vector(),
                self.rip
            );
        }
        if self.cs > 0x100 || self.ds > 0x100 || self.ss > 0x100 {
            panic!(
                "trap context has invalid selectors cs={:#x} ds={:#x} ss={:#x}",
                self.cs, self.ds, self.ss
            );
        }
        if VirtualAddress::try_new(self.rip as usize).is_none() {
            panic!("trap context has non-canonical rip {:#x}", self.rip);
        }
        if self.rip < 0xFFFF_8000_0000_0000 && self.cs == KERNEL_CODE_SELECTOR {
            panic!("trap context returns to user rip {:#x} with the kernel code selector", self.rip);
        }
    }
}

impl core::fmt::Debug for TrapContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrapContext")
            .field("vector", &self.vector())
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("rflags", &format_args!("{:#x}", self.rflags))
            .field("cr2", &format_args!("{:#x}", self.cr2))
            .field("cr8", &self.cr8)
            .finish_non_exhaustive()
    }
}
