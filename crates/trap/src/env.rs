//! The kernel state the dispatcher consults: processors, threads and the scheduler.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use vmm::{FaultClassifier, FaultingThread};

use crate::TrapContext;

/// Per-processor state touched by the dispatcher.
#[derive(Debug, Default)]
pub struct ProcessorLocal {
    spinlocks_held: AtomicUsize,
    in_irq: AtomicBool,
    switch_requested: AtomicBool,
    scheduler_ready: AtomicBool,
}

impl ProcessorLocal {
    pub const fn new() -> Self {
        Self {
            spinlocks_held: AtomicUsize::new(0),
            in_irq: AtomicBool::new(false),
            switch_requested: AtomicBool::new(false),
            scheduler_ready: AtomicBool::new(false),
        }
    }

    /// Number of spinlocks the processor currently holds.
    pub fn spinlocks_held(&self) -> usize {
        self.spinlocks_held.load(Ordering::Relaxed)
    }

    pub fn spinlock_acquired(&self) {
        self.spinlocks_held.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spinlock_released(&self) {
        let previous = self.spinlocks_held.fetch_sub(1, Ordering::Relaxed);
        assert!(previous != 0, "spinlock released more often than acquired");
    }

    /// True while IRQ handlers are running.
    pub fn in_irq(&self) -> bool {
        self.in_irq.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_irq(&self, in_irq: bool) {
        self.in_irq.store(in_irq, Ordering::Relaxed);
    }

    /// Asks for a thread switch once the current interrupt has been handled.
    pub fn request_switch(&self) {
        self.switch_requested.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_switch_request(&self) -> bool {
        self.switch_requested.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn clear_switch_request(&self) {
        self.switch_requested.store(false, Ordering::Relaxed);
    }

    pub fn scheduler_ready(&self) -> bool {
        self.scheduler_ready.load(Ordering::Relaxed)
    }

    pub fn set_scheduler_ready(&self, ready: bool) {
        self.scheduler_ready.store(ready, Ordering::Relaxed);
    }
}

/// Whether a thread may be terminated where it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Terminatable {
    Yes = 0,
    /// Inside a system call (or a user exception, which is handled like one); termination
    /// waits until the thread leaves the kernel.
    InSyscall = 1,
}

/// Trap-related state of a thread.
#[derive(Debug)]
pub struct ThreadState {
    kernel_thread: bool,
    terminatable: AtomicU8,
    terminating: AtomicBool,
    paused: AtomicBool,
    in_safe_copy: AtomicBool,
    received_yield_ipi: AtomicBool,
}

impl ThreadState {
    pub const fn new(kernel_thread: bool) -> Self {
        Self {
            kernel_thread,
            terminatable: AtomicU8::new(Terminatable::Yes as u8),
            terminating: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            in_safe_copy: AtomicBool::new(false),
            received_yield_ipi: AtomicBool::new(false),
        }
    }

    pub fn is_kernel_thread(&self) -> bool {
        self.kernel_thread
    }

    pub fn terminatable(&self) -> Terminatable {
        match self.terminatable.load(Ordering::Acquire) {
            0 => Terminatable::Yes,
            _ => Terminatable::InSyscall,
        }
    }

    /// Sets the terminatable state, returning the previous one.
    pub fn set_terminatable(&self, state: Terminatable) -> Terminatable {
        match self.terminatable.swap(state as u8, Ordering::AcqRel) {
            0 => Terminatable::Yes,
            _ => Terminatable::InSyscall,
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// True while the thread copies from or to user memory and expects faults.
    pub fn in_safe_copy(&self) -> bool {
        self.in_safe_copy.load(Ordering::Acquire)
    }

    pub fn set_in_safe_copy(&self, active: bool) {
        self.in_safe_copy.store(active, Ordering::Release);
    }

    pub fn received_yield_ipi(&self) -> bool {
        self.received_yield_ipi.load(Ordering::Acquire)
    }

    pub(crate) fn note_yield_ipi(&self) {
        self.received_yield_ipi.store(true, Ordering::Release);
    }
}

/// A thread as the dispatcher sees it.
pub trait TrapThread {
    fn state(&self) -> &ThreadState;
    /// The thread's address spaces, for page faults.
    fn faulting(&self) -> &dyn FaultingThread;
}

/// Why a process was terminated by a processor exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashReason {
    pub vector: u8,
    pub error_code: u64,
    /// `cr2` at the time of the exception.
    pub fault_address: u64,
    pub instruction_pointer: u64,
}

impl CrashReason {
    pub fn from_context(context: &TrapContext) -> Self {
        Self {
            vector: context.vector().value(),
            error_code: context.error_code,
            fault_address: context.cr2,
            instruction_pointer: context.rip,
        }
    }
}

/// The rest of the kernel, as far as trap handling is concerned.
pub trait TrapEnvironment: Sync {
    /// State of the calling processor, once per-processor storage is set up.
    fn processor(&self) -> Option<&ProcessorLocal>;

    fn current_thread(&self) -> Option<&dyn TrapThread>;

    /// Resolves page faults against the kernel space and the memory manager.
    fn fault_classifier(&self) -> FaultClassifier<'_>;

    fn scheduler_started(&self) -> bool;

    /// True once the kernel has panicked; only NMIs are handled from then on.
    fn scheduler_panicking(&self) -> bool;

    /// Terminates the process `thread` belongs to. The thread keeps running until it
    /// leaves the kernel.
    fn crash_process(&self, thread: &dyn TrapThread, reason: CrashReason);

    /// Switches to another thread by rewriting `context`.
    fn reschedule(&self, context: &mut TrapContext);

    /// Signals end of interrupt to the local APIC.
    fn end_of_interrupt(&self);
}
