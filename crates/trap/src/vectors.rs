//! Interrupt vector assignments.

/// Defines the [`Vector`] type and its named vectors.
#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// An interrupt vector (an index into the IDT).
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct Vector($storage);

        impl Vector {
            $(
                pub const $name: Self = Self($value);
            )*

            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the vector, if it has one.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for Vector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "Vector::{}({:#x})", name, self.0)
                } else {
                    write!(f, "Vector({:#x})", self.0)
                }
            }
        }

        impl core::fmt::Display for Vector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{:#x}", self.0)
                }
            }
        }
    }
}

crate::interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    COPROCESSOR_SEGMENT_OVERRUN = 9,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT_EXCEPTION = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT_EXCEPTION = 19,
    VIRTUALIZATION_EXCEPTION = 20,
    CP_PROTECTION_EXCEPTION = 21,
    HV_INJECTION_EXCEPTION = 28,
    VMM_COMMUNICATION_EXCEPTION = 29,
    SECURITY_EXCEPTION = 30,
    TIMER = 0x40,
    YIELD = 0x41,
    CALL_FUNCTION = 0xF0,
    TLB_SHOOTDOWN = 0xF1,
    APIC_SPURIOUS = 0xFF,
}

/// First vector the legacy PIC delivers to. The PIC is masked, so anything here is spurious.
pub const PIC_SPURIOUS_BASE: u8 = 0x20;
pub const PIC_SPURIOUS_END: u8 = 0x30;

pub const IRQ_BASE: u8 = 0x50;
/// Number of legacy IRQ lines routed through the IO APIC.
pub const IRQ_LINES: u8 = 0x20;

pub const MSI_BASE: u8 = 0x70;
pub const MSI_COUNT: u8 = 0x40;

pub const IPI_BASE: u8 = 0xF0;
/// One past the last IPI vector.
pub const IPI_END: u8 = 0xFE;

/// The `cr8` value spinlocks raise the priority to. IPIs are still delivered above it.
pub const IPI_PRIORITY: u64 = 0xE;

/// What kind of trap a vector carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClass {
    /// CPU-generated, vectors below 0x20.
    Exception,
    Spurious,
    Timer,
    Yield,
    /// A legacy IRQ line.
    Irq(u8),
    /// A slot of the MSI table.
    Msi(u8),
    Ipi,
    /// Nothing is assigned to the vector.
    Unassigned,
}

impl Vector {
    pub const fn class(self) -> VectorClass {
        match self.0 {
            0x00..0x20 => VectorClass::Exception,
            PIC_SPURIOUS_BASE..PIC_SPURIOUS_END | 0xFF => VectorClass::Spurious,
            0x40 => VectorClass::Timer,
            0x41 => VectorClass::Yield,
            v if v >= IRQ_BASE && v < IRQ_BASE + IRQ_LINES => VectorClass::Irq(v - IRQ_BASE),
            v if v >= MSI_BASE && v < MSI_BASE + MSI_COUNT => VectorClass::Msi(v - MSI_BASE),
            IPI_BASE..IPI_END => VectorClass::Ipi,
            _ => VectorClass::Unassigned,
        }
    }

    /// Returns true for exceptions that push an error code.
    ///
    /// The entry stubs push a zero for every other vector so the frame layout is uniform.
    pub const fn has_error_code(self) -> bool {
        matches!(self.0, 8 | 10..=14 | 17 | 21 | 29 | 30)
    }

    /// Returns the vector of IRQ line `line`.
    pub const fn irq(line: u8) -> Self {
        assert!(line < IRQ_LINES, "IRQ line out of range");
        Self(IRQ_BASE + line)
    }

    /// Returns the vector of MSI slot `index`.
    pub const fn msi(index: u8) -> Self {
        assert!(index < MSI_COUNT, "MSI index out of range");
        Self(MSI_BASE + index)
    }
}
