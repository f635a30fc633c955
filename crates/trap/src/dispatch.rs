//! Routing a trap to whatever handles its vector.

use vmm::{FaultingThread, IpiChannel, TlbShootdown, Window, layout::USER_SPACE_END};

use crate::{
    CrashReason, FunctionCall, IPI_PRIORITY, IpiTable, IrqTable, KERNEL_CODE_SELECTOR, MsiTable,
    PrivilegeMode, ProcessorLocal, Terminatable, TrapContext, TrapEnvironment, USER_CODE_SELECTOR,
    Vector, VectorClass,
    arch::{disable_interrupts, enable_interrupts, interrupts_enabled},
    function_call,
};

/// What the entry stub does once the dispatcher returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted context.
    Resume,
    /// The context was replaced with another thread's.
    Rescheduled,
    /// Nothing was done.
    Ignored,
    /// Stop the processor.
    Halt,
}

/// The handler tables and IPI state every trap is dispatched against.
pub struct Dispatcher<'a> {
    irqs: IrqTable,
    msis: MsiTable,
    ipis: IpiTable,
    channel: &'a IpiChannel,
    shootdown: &'a TlbShootdown,
    calls: &'a FunctionCall,
}

impl Dispatcher<'static> {
    /// A dispatcher over the system-wide IPI channel.
    pub const fn new() -> Self {
        Self::with_ipi_state(vmm::ipi_channel(), vmm::tlb_shootdown(), function_call())
    }
}

impl Default for Dispatcher<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Dispatcher<'a> {
    pub const fn with_ipi_state(
        channel: &'a IpiChannel,
        shootdown: &'a TlbShootdown,
        calls: &'a FunctionCall,
    ) -> Self {
        Self {
            irqs: IrqTable::new(),
            msis: MsiTable::new(),
            ipis: IpiTable::new(),
            channel,
            shootdown,
            calls,
        }
    }

    pub fn irqs(&self) -> &IrqTable {
        &self.irqs
    }

    pub fn msis(&self) -> &MsiTable {
        &self.msis
    }

    pub fn ipis(&self) -> &IpiTable {
        &self.ipis
    }

    /// Handles the trap saved in `context`.
    ///
    /// Must be entered with interrupts disabled, and returns with them disabled.
    ///
    /// # Panics
    ///
    /// Panics on exceptions the kernel cannot recover from, and if `context` is no longer
    /// fit to return to.
    pub fn handle_trap(&self, env: &dyn TrapEnvironment, context: &mut TrapContext) -> TrapOutcome {
        let vector = context.vector();
        if env.scheduler_panicking() && vector != Vector::NON_MASKABLE_INTERRUPT {
            return TrapOutcome::Ignored;
        }
        if interrupts_enabled() {
            panic!("interrupts were enabled at the start of a trap handler");
        }

        let outcome = match vector.class() {
            VectorClass::Exception => self.handle_exception(env, context),
            VectorClass::Spurious => TrapOutcome::Ignored,
            VectorClass::Ipi => {
                // Runs with whatever locks the interrupted code holds, so takes none.
                match vector {
                    Vector::CALL_FUNCTION => self.calls.handle_ipi(self.channel),
                    Vector::TLB_SHOOTDOWN => self.shootdown.handle_ipi(self.channel),
                    _ => {
                        if !self.ipis.dispatch(vector) {
                            log::warn!("IPI {vector} has no handler");
                        }
                    }
                }
                env.end_of_interrupt();
                TrapOutcome::Resume
            }
            VectorClass::Unassigned => {
                log::warn!("unexpected interrupt on unassigned vector {vector}");
                env.end_of_interrupt();
                TrapOutcome::Resume
            }
            class => match env.processor() {
                Some(local) => self.handle_device(env, local, class, context),
                None => {
                    log::warn!("interrupt {vector} before processor-local storage was set up");
                    TrapOutcome::Ignored
                }
            },
        };

        if outcome == TrapOutcome::Halt {
            return outcome;
        }
        context.sanity_check();
        if interrupts_enabled() {
            panic!("interrupts were enabled while returning from a trap handler");
        }
        outcome
    }

    fn handle_exception(&self, env: &dyn TrapEnvironment, context: &mut TrapContext) -> TrapOutcome {
        if context.vector() == Vector::NON_MASKABLE_INTERRUPT {
            // Another processor panicked and is stopping the rest.
            return TrapOutcome::Halt;
        }
        match context.mode() {
            PrivilegeMode::User => self.handle_user_exception(env, context),
            PrivilegeMode::Supervisor => {
                if context.cs != KERNEL_CODE_SELECTOR {
                    panic!("supervisor exception with code selector {:#x}", context.cs);
                }
                let recovered =
                    context.vector() == Vector::PAGE_FAULT && handle_kernel_page_fault(env, context);
                if !recovered {
                    panic!(
                        "unresolvable processor exception {} in supervisor mode: {context:?}",
                        context.vector()
                    );
                }
                TrapOutcome::Resume
            }
        }
    }

    /// User exceptions are handled like a system call the thread did not ask for: the
    /// thread cannot be terminated while its fault is being resolved.
    fn handle_user_exception(
        &self,
        env: &dyn TrapEnvironment,
        context: &mut TrapContext,
    ) -> TrapOutcome {
        if context.cs != USER_CODE_SELECTOR {
            panic!("user exception with code selector {:#x}", context.cs);
        }
        let Some(thread) = env.current_thread() else {
            panic!("user exception with no current thread");
        };
        let state = thread.state();
        if state.is_kernel_thread() {
            panic!("kernel thread trapped in user mode");
        }

        let previous = state.set_terminatable(Terminatable::InSyscall);
        if env.processor().is_some_and(|local| local.spinlocks_held() != 0) {
            panic!("spinlocks held on entry to a user exception");
        }
        enable_interrupts();

        let vector = context.vector();
        let resolved = vector == Vector::PAGE_FAULT
            && match env.fault_classifier().handle(
                context.cr2 as usize,
                context.fault_flags(),
                Some(thread.faulting()),
            ) {
                Ok(()) => true,
                Err(error) => {
                    log::debug!("user page fault at {:#x}: {error:?}", context.cr2);
                    false
                }
            };
        if !resolved {
            log::error!(
                "unhandled {vector} in user mode at rip {:#x} (error code {:#x}, cr2 {:#x})",
                context.rip,
                context.error_code,
                context.cr2
            );
            env.crash_process(thread, CrashReason::from_context(context));
        }

        if state.terminatable() != Terminatable::InSyscall {
            panic!("user exception handler changed the terminatable state");
        }
        state.set_terminatable(previous);
        disable_interrupts();

        if state.is_terminating() || state.is_paused() {
            env.reschedule(context);
            TrapOutcome::Rescheduled
        } else {
            TrapOutcome::Resume
        }
    }

    /// Timer, yield, IRQ and MSI vectors. These may switch threads once acknowledged.
    fn handle_device(
        &self,
        env: &dyn TrapEnvironment,
        local: &ProcessorLocal,
        class: VectorClass,
        context: &mut TrapContext,
    ) -> TrapOutcome {
        local.clear_switch_request();
        match class {
            VectorClass::Timer => local.request_switch(),
            VectorClass::Yield => {
                local.request_switch();
                if let Some(thread) = env.current_thread() {
                    thread.state().note_yield_ipi();
                }
            }
            VectorClass::Irq(line) => {
                local.set_in_irq(true);
                if !self.irqs.dispatch(line) {
                    log::trace!("IRQ {line} not claimed by any handler");
                }
                local.set_in_irq(false);
            }
            VectorClass::Msi(index) => {
                if !self.msis.dispatch(index) {
                    log::warn!("MSI {index} has no handler");
                }
            }
            other => log::warn!("{other:?} is not a device vector"),
        }
        env.end_of_interrupt();

        if local.take_switch_request() && env.scheduler_started() && local.scheduler_ready() {
            env.reschedule(context);
            TrapOutcome::Rescheduled
        } else {
            TrapOutcome::Resume
        }
    }
}

/// Page fault taken by kernel code. Returns true if execution can continue.
fn handle_kernel_page_fault(env: &dyn TrapEnvironment, context: &mut TrapContext) -> bool {
    if context.is_reserved_bit_fault() {
        return false;
    }
    if context.interrupts_were_enabled() && context.cr8 < IPI_PRIORITY {
        enable_interrupts();
    }

    let address = context.cr2 as usize;
    // Pageable memory may block on I/O, which is not allowed under a spinlock.
    let pageable = address < USER_SPACE_END || Window::KernelSpace.range().contains(&address);
    if pageable && env.processor().is_some_and(|local| local.spinlocks_held() != 0) {
        disable_interrupts();
        panic!("page fault at {address:#x} in pageable memory with spinlocks held");
    }

    let thread = env.current_thread();
    let faulting: Option<&dyn FaultingThread> = thread.map(|thread| thread.faulting());
    let recovered = match env
        .fault_classifier()
        .handle(address, context.fault_flags(), faulting)
    {
        Ok(()) => true,
        Err(error) => {
            if address < USER_SPACE_END && thread.is_some_and(|thread| thread.state().in_safe_copy()) {
                // The copy routine keeps its recovery address in r8.
                log::debug!("fault at {address:#x} during a user copy ({error:?})");
                context.rip = context.r8;
                true
            } else {
                log::error!("kernel page fault at {address:#x}: {error:?}");
                false
            }
        }
    };
    disable_interrupts();
    recovered
}

static DISPATCHER: Dispatcher<'static> = Dispatcher::new();

/// The dispatcher the entry stubs call.
pub fn dispatcher() -> &'static Dispatcher<'static> {
    &DISPATCHER
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use vmm::{
        AddressSpace, FaultClassifier, FaultRequest, MemoryManager, PhysicalAddress,
        VirtualAddress,
        layout::{KERNEL_SPACE_START, LOW_MEMORY_MAP_START, USER_SPACE_START},
        testing::{EmulatedFrameAllocator, SimulatedProcessors, setup},
    };

    use super::*;
    use crate::{ThreadState, TrapThread};

    const KERNEL_RIP: u64 = 0xFFFF_FFFF_8010_0000;
    const USER_RIP: u64 = 0x40_1000;

    struct Manager {
        verdict: bool,
        /// Interrupt flag observed by each call.
        interrupts: spin::Mutex<Vec<bool>>,
    }

    impl MemoryManager for Manager {
        fn handle_page_fault(&self, _request: FaultRequest<'_>) -> bool {
            self.interrupts.lock().push(interrupts_enabled());
            self.verdict
        }
    }

    struct Thread {
        state: ThreadState,
        process: AddressSpace,
    }

    impl FaultingThread for Thread {
        fn temporary_space(&self) -> Option<&AddressSpace> {
            None
        }

        fn process_space(&self) -> &AddressSpace {
            &self.process
        }
    }

    impl TrapThread for Thread {
        fn state(&self) -> &ThreadState {
            &self.state
        }

        fn faulting(&self) -> &dyn FaultingThread {
            self
        }
    }

    /// A single processor running one user thread.
    struct TestEnv {
        alloc: EmulatedFrameAllocator,
        kernel: AddressSpace,
        manager: Manager,
        local: Option<ProcessorLocal>,
        thread: Option<Thread>,
        started: bool,
        panicking: bool,
        crashes: spin::Mutex<Vec<CrashReason>>,
        reschedules: AtomicUsize,
        eois: AtomicUsize,
    }

    impl TestEnv {
        fn new() -> Self {
            setup();
            let alloc = EmulatedFrameAllocator::new();
            let kernel = AddressSpace::new_kernel(&alloc).unwrap();
            let process = AddressSpace::new_user(&kernel, &alloc).unwrap();
            Self {
                alloc,
                kernel,
                manager: Manager {
                    verdict: false,
                    interrupts: spin::Mutex::new(Vec::new()),
                },
                local: Some(ProcessorLocal::new()),
                thread: Some(Thread {
                    state: ThreadState::new(false),
                    process,
                }),
                started: true,
                panicking: false,
                crashes: spin::Mutex::new(Vec::new()),
                reschedules: AtomicUsize::new(0),
                eois: AtomicUsize::new(0),
            }
        }

        fn local(&self) -> &ProcessorLocal {
            self.local.as_ref().unwrap()
        }

        fn thread_state(&self) -> &ThreadState {
            &self.thread.as_ref().unwrap().state
        }
    }

    impl TrapEnvironment for TestEnv {
        fn processor(&self) -> Option<&ProcessorLocal> {
            self.local.as_ref()
        }

        fn current_thread(&self) -> Option<&dyn TrapThread> {
            self.thread.as_ref().map(|thread| thread as &dyn TrapThread)
        }

        fn fault_classifier(&self) -> FaultClassifier<'_> {
            FaultClassifier::new(&self.kernel, &self.alloc, &self.manager)
        }

        fn scheduler_started(&self) -> bool {
            self.started
        }

        fn scheduler_panicking(&self) -> bool {
            self.panicking
        }

        fn crash_process(&self, thread: &dyn TrapThread, reason: CrashReason) {
            self.crashes.lock().push(reason);
            thread.state().set_terminating();
        }

        fn reschedule(&self, _context: &mut TrapContext) {
            self.reschedules.fetch_add(1, Ordering::SeqCst);
        }

        fn end_of_interrupt(&self) {
            self.eois.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn page_fault(mode: PrivilegeMode, address: u64, error_code: u64) -> TrapContext {
        let rip = match mode {
            PrivilegeMode::User => USER_RIP,
            PrivilegeMode::Supervisor => KERNEL_RIP,
        };
        let mut context = TrapContext::new(Vector::PAGE_FAULT, error_code, mode, rip);
        context.cr2 = address;
        context
    }

    fn interrupt(vector: Vector) -> TrapContext {
        TrapContext::new(vector, 0, PrivilegeMode::Supervisor, KERNEL_RIP)
    }

    #[test]
    fn user_null_dereference_crashes_the_process() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        let mut context = page_fault(PrivilegeMode::User, 0x10, 4);

        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Rescheduled);
        assert_eq!(
            *env.crashes.lock(),
            [CrashReason {
                vector: 14,
                error_code: 4,
                fault_address: 0x10,
                instruction_pointer: USER_RIP,
            }]
        );
        assert_eq!(env.thread_state().terminatable(), Terminatable::Yes);
        assert_eq!(env.reschedules.load(Ordering::SeqCst), 1);
        assert!(!interrupts_enabled());
    }

    #[test]
    fn resolved_user_fault_resumes() {
        let mut env = TestEnv::new();
        env.manager.verdict = true;
        let dispatcher = Dispatcher::new();
        let mut context = page_fault(PrivilegeMode::User, (USER_SPACE_START + 0x5000) as u64, 6);

        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert!(env.crashes.lock().is_empty());
        assert_eq!(env.eois.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_exceptions_other_than_page_faults_crash() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        let mut context = TrapContext::new(Vector::INVALID_OPCODE, 0, PrivilegeMode::User, USER_RIP);

        dispatcher.handle_trap(&env, &mut context);
        assert_eq!(env.crashes.lock()[0].vector, 6);
        assert!(env.thread_state().is_terminating());
    }

    #[test]
    fn paused_thread_is_rescheduled_after_its_fault() {
        let mut env = TestEnv::new();
        env.manager.verdict = true;
        env.thread_state().set_paused(true);
        let dispatcher = Dispatcher::new();
        let mut context = page_fault(PrivilegeMode::User, USER_SPACE_START as u64, 0);

        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Rescheduled);
        assert!(env.crashes.lock().is_empty());
    }

    #[test]
    fn kernel_fault_in_low_memory_is_mapped() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        let address = LOW_MEMORY_MAP_START + 0xB8000;
        let mut context = page_fault(PrivilegeMode::Supervisor, address as u64, 0);

        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(
            env.kernel.translate(VirtualAddress::new(address)),
            Some(PhysicalAddress::new(0xB8000))
        );
        assert!(!interrupts_enabled());
    }

    fn kernel_space_fault_interrupt_state(rflags: u64, cr8: u64) -> Vec<bool> {
        let mut env = TestEnv::new();
        env.manager.verdict = true;
        let mut context = page_fault(PrivilegeMode::Supervisor, KERNEL_SPACE_START as u64, 0);
        context.rflags = rflags;
        context.cr8 = cr8;

        assert_eq!(Dispatcher::new().handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert!(!interrupts_enabled());
        env.manager.interrupts.into_inner()
    }

    #[test]
    fn kernel_faults_run_with_interrupts_when_the_interrupted_code_allowed_them() {
        assert_eq!(kernel_space_fault_interrupt_state(0x202, 0), [true]);
    }

    #[test]
    fn kernel_faults_keep_interrupts_off_at_ipi_priority() {
        assert_eq!(kernel_space_fault_interrupt_state(0x202, IPI_PRIORITY), [false]);
    }

    #[test]
    fn kernel_faults_keep_interrupts_off_if_they_were_off() {
        assert_eq!(kernel_space_fault_interrupt_state(0x2, 0), [false]);
    }

    #[test]
    #[should_panic(expected = "unresolvable processor exception")]
    fn kernel_general_protection_fault_panics() {
        let env = TestEnv::new();
        let mut context = TrapContext::new(
            Vector::GENERAL_PROTECTION_FAULT,
            0,
            PrivilegeMode::Supervisor,
            KERNEL_RIP,
        );
        Dispatcher::new().handle_trap(&env, &mut context);
    }

    #[test]
    #[should_panic(expected = "unresolvable processor exception")]
    fn reserved_bit_faults_are_fatal() {
        let env = TestEnv::new();
        let address = LOW_MEMORY_MAP_START as u64;
        let mut context = page_fault(PrivilegeMode::Supervisor, address, 0b1001);
        Dispatcher::new().handle_trap(&env, &mut context);
    }

    #[test]
    #[should_panic(expected = "spinlocks held")]
    fn pageable_fault_under_spinlock_panics() {
        let env = TestEnv::new();
        env.local().spinlock_acquired();
        let mut context = page_fault(PrivilegeMode::Supervisor, KERNEL_SPACE_START as u64, 0);
        Dispatcher::new().handle_trap(&env, &mut context);
    }

    #[test]
    fn user_copy_faults_jump_to_the_recovery_address() {
        let env = TestEnv::new();
        env.thread_state().set_in_safe_copy(true);
        let dispatcher = Dispatcher::new();
        let mut context = page_fault(PrivilegeMode::Supervisor, (USER_SPACE_START + 0x1000) as u64, 0);
        context.r8 = KERNEL_RIP + 0x40;

        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(context.rip, KERNEL_RIP + 0x40);
    }

    #[test]
    fn spurious_vectors_are_ignored() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        for vector in [Vector::new(0x27), Vector::APIC_SPURIOUS] {
            let mut context = interrupt(vector);
            assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Ignored);
        }
        assert_eq!(env.eois.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timer_switches_threads_once_the_scheduler_is_ready() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();

        let mut context = interrupt(Vector::TIMER);
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);

        env.local().set_scheduler_ready(true);
        let mut context = interrupt(Vector::TIMER);
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Rescheduled);
        assert_eq!(env.eois.load(Ordering::SeqCst), 2);
        assert_eq!(env.reschedules.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_is_recorded_on_the_thread() {
        let env = TestEnv::new();
        env.local().set_scheduler_ready(true);
        let mut context = interrupt(Vector::YIELD);

        assert_eq!(
            Dispatcher::new().handle_trap(&env, &mut context),
            TrapOutcome::Rescheduled
        );
        assert!(env.thread_state().received_yield_ipi());
    }

    static IRQ_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_irq(line: u8, context: usize) -> bool {
        assert_eq!(line, 3);
        IRQ_CALLS.fetch_add(context, Ordering::SeqCst);
        true
    }

    #[test]
    fn irqs_reach_their_handlers() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        dispatcher.irqs().register(Some(3), count_irq, 1).unwrap();
        let before = IRQ_CALLS.load(Ordering::SeqCst);

        let mut context = interrupt(Vector::irq(3));
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(IRQ_CALLS.load(Ordering::SeqCst), before + 1);
        assert!(!env.local().in_irq());
        assert_eq!(env.eois.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn msi_without_handler_is_acknowledged() {
        let env = TestEnv::new();
        let mut context = interrupt(Vector::msi(5));
        assert_eq!(Dispatcher::new().handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(env.eois.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_interrupts_need_processor_local_state() {
        let mut env = TestEnv::new();
        env.local = None;
        let mut context = interrupt(Vector::irq(1));
        assert_eq!(Dispatcher::new().handle_trap(&env, &mut context), TrapOutcome::Ignored);
        assert_eq!(env.eois.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unassigned_vectors_are_acknowledged() {
        let env = TestEnv::new();
        let mut context = interrupt(Vector::new(0xB0));
        assert_eq!(Dispatcher::new().handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(env.eois.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_kernel_only_handles_nmi() {
        let mut env = TestEnv::new();
        env.panicking = true;
        let dispatcher = Dispatcher::new();

        let mut context = interrupt(Vector::TIMER);
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Ignored);
        let mut context = interrupt(Vector::NON_MASKABLE_INTERRUPT);
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Halt);
    }

    #[test]
    #[should_panic(expected = "magic")]
    fn corrupted_context_is_caught_on_return() {
        let env = TestEnv::new();
        let mut context = interrupt(Vector::TIMER);
        context.magic = 0;
        Dispatcher::new().handle_trap(&env, &mut context);
    }

    #[test]
    #[should_panic(expected = "enabled at the start")]
    fn entering_with_interrupts_enabled_panics() {
        let env = TestEnv::new();
        enable_interrupts();
        let mut context = interrupt(Vector::TIMER);
        Dispatcher::new().handle_trap(&env, &mut context);
    }

    static CUSTOM_IPIS: AtomicUsize = AtomicUsize::new(0);

    fn custom_ipi() {
        CUSTOM_IPIS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn registered_ipis_run() {
        let env = TestEnv::new();
        let dispatcher = Dispatcher::new();
        dispatcher.ipis().register(Vector::new(0xF4), custom_ipi).unwrap();
        let before = CUSTOM_IPIS.load(Ordering::SeqCst);

        let mut context = interrupt(Vector::new(0xF4));
        assert_eq!(dispatcher.handle_trap(&env, &mut context), TrapOutcome::Resume);
        assert_eq!(CUSTOM_IPIS.load(Ordering::SeqCst), before + 1);
        assert_eq!(env.eois.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ipi_vectors_match_the_memory_layer() {
        assert_eq!(Vector::CALL_FUNCTION.value(), vmm::CALL_FUNCTION_IPI);
        assert_eq!(Vector::TLB_SHOOTDOWN.value(), vmm::TLB_SHOOTDOWN_IPI);
    }

    #[test]
    fn shootdown_ipi_is_handled_through_the_dispatcher() {
        use vmm::{Invalidation, Shootdown, TlbInvalidator, take_invalidations};

        let env = TestEnv::new();
        let channel = IpiChannel::new();
        let shootdown = TlbShootdown::new();
        let calls = FunctionCall::new();
        let dispatcher = Dispatcher::with_ipi_state(&channel, &shootdown, &calls);
        let machine = SimulatedProcessors::new(2);
        let done = AtomicUsize::new(0);

        let remote: Vec<Invalidation> = std::thread::scope(|scope| {
            let (env, dispatcher, machine, done) = (&env, &dispatcher, &machine, &done);
            let receiver = scope.spawn(move || {
                take_invalidations();
                let handler = |vector: u8| {
                    let mut context = interrupt(Vector::new(vector));
                    assert_eq!(dispatcher.handle_trap(env, &mut context), TrapOutcome::Resume);
                };
                let cpu = machine.processor(1, &handler);
                while done.load(Ordering::SeqCst) == 0 {
                    cpu.service();
                    core::hint::spin_loop();
                }
                take_invalidations()
            });

            let ignore = |_vector: u8| {};
            let cpu = machine.processor(0, &ignore);
            Shootdown::new(&channel, &shootdown, &cpu).invalidate(VirtualAddress::new(0x7000), 1);
            done.store(1, Ordering::SeqCst);
            receiver.join().unwrap()
        });

        assert_eq!(remote, [Invalidation::Page(VirtualAddress::new(0x7000))]);
        assert_eq!(channel.pending(), 0);
        assert_eq!(env.eois.load(Ordering::SeqCst), 1);
    }
}
