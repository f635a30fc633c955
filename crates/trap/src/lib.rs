#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Essence trap dispatch
//!
//! Every interrupt, exception and IPI enters the kernel through one entry stub per vector,
//! which saves the interrupted state as a [`TrapContext`] and hands it to the
//! [`Dispatcher`]. The dispatcher demultiplexes by vector and privilege level:
//!
//! - exceptions are resolved (page faults, through [`vmm::FaultClassifier`]), turned into a
//!   process crash (user mode) or a kernel panic (supervisor mode);
//! - IRQ and MSI vectors run the registered device handlers;
//! - IPI vectors run their callback without taking any lock;
//! - timer and yield vectors ask the scheduler to switch threads.

mod arch;
mod context;
mod dispatch;
mod env;
mod ipi;
mod registry;
mod vectors;

pub use context::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, PrivilegeMode, TRAP_CONTEXT_MAGIC, TrapContext,
    USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
pub use dispatch::{Dispatcher, TrapOutcome, dispatcher};
pub use env::{CrashReason, ProcessorLocal, Terminatable, ThreadState, TrapEnvironment, TrapThread};
pub use ipi::{FunctionCall, call_on_all_processors, function_call, handle_call_function_ipi};
pub use registry::{
    IpiCallback, IpiTable, IrqCallback, IrqTable, MAX_IRQ_HANDLERS, MsiCallback, MsiTable,
    MsiVector, PCI_IRQ_LINES, RegisterError,
};
pub use vectors::{IPI_PRIORITY, IRQ_BASE, MSI_BASE, Vector, VectorClass};

pub use arch::{disable_interrupts, enable_interrupts, interrupts_enabled};

#[cfg(all(target_arch = "x86_64", not(any(test, feature = "software-emulation"))))]
pub use arch::install;
