//! x86_64 hardware implementation: entry stubs, GDT, TSS and IDT.

use core::arch::global_asm;

use x86_64::{
    VirtAddr,
    instructions::{hlt, interrupts, tables::load_tss},
    registers::segmentation::{CS, DS, ES, SS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        idt::InterruptDescriptorTable,
        tss::TaskStateSegment,
    },
};

use crate::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, TrapContext, TrapEnvironment, TrapOutcome,
    USER_CODE_SELECTOR, USER_DATA_SELECTOR, dispatcher,
};

pub fn enable_interrupts() {
    interrupts::enable();
}

pub fn disable_interrupts() {
    interrupts::disable();
}

pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

const DOUBLE_FAULT_IST_INDEX: u16 = 0;
/// Distance between consecutive entry stubs.
const STUB_SIZE: u64 = 16;

// One stub per vector. Each pushes a zero in place of the error code when the processor
// does not supply one, then the vector number, so every trap reaches `trap_common` with the
// same frame. `trap_common` completes a `TrapContext` below it.
global_asm!(
    r#"
    .pushsection .text.trap_entry, "ax"
    .global trap_stubs
    .balign 16
trap_stubs:
    .set trap_vector, 0
    .rept 256
    .balign 16
    .if !(trap_vector == 8 || (trap_vector >= 10 && trap_vector <= 14) || trap_vector == 17 || trap_vector == 21 || trap_vector == 29 || trap_vector == 30)
    pushq $0
    .endif
    pushq $trap_vector
    jmp trap_common
    .set trap_vector, trap_vector + 1
    .endr

trap_common:
    cld
    testb $3, 24(%rsp)
    jz 1f
    swapgs
1:
    push %rax
    push %rbx
    push %rcx
    push %rdx
    push %rsi
    push %rdi
    push %rbp
    push %r8
    push %r9
    push %r10
    push %r11
    push %r12
    push %r13
    push %r14
    push %r15
    mov %cr8, %rax
    push %rax
    movabs $0x0123456789ABCDEF, %rax
    push %rax
    sub $528, %rsp
    mov %rsp, %rbx
    add $15, %rbx
    and $~15, %rbx
    fxsave (%rbx)
    xor %eax, %eax
    mov %ds, %ax
    push %rax
    mov %cr2, %rax
    push %rax

    mov $0x10, %ax
    mov %ax, %ds
    mov %ax, %es

    mov %rsp, %rdi
    mov %rsp, %rbx
    and $~15, %rsp
    call trap_dispatch
    mov %rbx, %rsp

    add $8, %rsp
    pop %rax
    mov %ax, %ds
    mov %ax, %es
    mov %rsp, %rbx
    add $15, %rbx
    and $~15, %rbx
    fxrstor (%rbx)
    add $536, %rsp
    pop %rax
    mov %rax, %cr8
    pop %r15
    pop %r14
    pop %r13
    pop %r12
    pop %r11
    pop %r10
    pop %r9
    pop %r8
    pop %rbp
    pop %rdi
    pop %rsi
    pop %rdx
    pop %rcx
    pop %rbx
    pop %rax
    testb $3, 24(%rsp)
    jz 2f
    swapgs
2:
    add $16, %rsp
    iretq
    .popsection
    "#,
    options(att_syntax)
);

unsafe extern "C" {
    static trap_stubs: [u8; 0];
}

fn stub(vector: u8) -> VirtAddr {
    VirtAddr::from_ptr(&raw const trap_stubs) + u64::from(vector) * STUB_SIZE
}

static ENVIRONMENT: spin::Once<&'static dyn TrapEnvironment> = spin::Once::new();

/// Called by `trap_common` with the context it saved.
#[unsafe(no_mangle)]
extern "C" fn trap_dispatch(context: &mut TrapContext) {
    let Some(env) = ENVIRONMENT.get() else {
        panic!("trap {} before the dispatcher was installed", context.vector());
    };
    if dispatcher().handle_trap(*env, context) == TrapOutcome::Halt {
        loop {
            hlt();
        }
    }
}

static TSS: spin::Once<TaskStateSegment> = spin::Once::new();
static GDT: spin::Once<(GlobalDescriptorTable, Selectors)> = spin::Once::new();
static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

fn tss() -> &'static TaskStateSegment {
    TSS.call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

            VirtAddr::from_ptr(&raw const STACK) + STACK_SIZE as u64
        };
        tss
    })
}

fn gdt() -> (&'static GlobalDescriptorTable, &'static Selectors) {
    let (gdt, selectors) = GDT.call_once(|| {
        // The order fixes the selector values the entry code and `sysret` rely on.
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(tss()));

        assert_eq!(u64::from(kernel_code.0), KERNEL_CODE_SELECTOR);
        assert_eq!(u64::from(kernel_data.0), KERNEL_DATA_SELECTOR);
        assert_eq!(u64::from(user_data.0), USER_DATA_SELECTOR);
        assert_eq!(u64::from(user_code.0), USER_CODE_SELECTOR);
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
            },
        )
    });
    (gdt, selectors)
}

fn idt() -> &'static InterruptDescriptorTable {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every stub is a valid entry point that ends in `iretq`.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt.set_handler_addr(stub(2));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            idt.virtualization.set_handler_addr(stub(20));
            idt.cp_protection_exception.set_handler_addr(stub(21));
            idt.hv_injection_exception.set_handler_addr(stub(28));
            idt.vmm_communication_exception.set_handler_addr(stub(29));
            idt.security_exception.set_handler_addr(stub(30));
            for vector in 32..=255u8 {
                idt[vector].set_handler_addr(stub(vector));
            }
        }
        idt
    })
}

/// Loads the GDT, TSS and IDT on the calling processor and routes every trap to
/// [`dispatcher`] with `env`.
///
/// The environment is fixed by the first call; later calls (from other processors) only
/// load the tables.
pub fn install(env: &'static dyn TrapEnvironment) {
    ENVIRONMENT.call_once(|| env);
    let (gdt, selectors) = gdt();
    gdt.load();
    // SAFETY: the selectors index the GDT that was just loaded.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
        SS::set_reg(selectors.kernel_data);
        load_tss(selectors.tss);
    }
    idt().load();
    log::debug!("trap entry installed");
}
