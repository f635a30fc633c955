//! Interrupt flag control and, on hardware, the entry stubs and descriptor tables.

// The hardware module defines the global entry symbols, so it is left out of test builds.
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
use self::x86_64 as active;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::install;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
use software as active;

/// Sets the interrupt flag of the calling processor.
#[inline]
pub fn enable_interrupts() {
    active::enable_interrupts();
}

/// Clears the interrupt flag of the calling processor.
#[inline]
pub fn disable_interrupts() {
    active::disable_interrupts();
}

#[inline]
pub fn interrupts_enabled() -> bool {
    active::interrupts_enabled()
}
