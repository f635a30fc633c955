//! Software emulation: every host thread is a processor with its own interrupt flag.
//!
//! Threads start with interrupts disabled, the state the entry stub leaves them in.

use core::cell::Cell;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(false) };
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));
}

pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}
