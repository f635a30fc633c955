//! Handler tables for device interrupts and IPIs.
//!
//! Dispatch runs in interrupt context and never takes a lock, so a processor interrupted in
//! the middle of a registration cannot deadlock on its own table.

use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::vectors::{IPI_BASE, IPI_END, IRQ_LINES, MSI_COUNT};
use crate::Vector;

/// Called for an IRQ on `line`. Returns true if the device raised it.
pub type IrqCallback = fn(line: u8, context: usize) -> bool;
/// Called for an MSI delivered to slot `index`.
pub type MsiCallback = fn(index: u8, context: usize);
pub type IpiCallback = fn();

pub const MAX_IRQ_HANDLERS: usize = 0x40;

/// Lines PCI interrupts may be routed to before the routing tables have been read.
pub const PCI_IRQ_LINES: [u8; 3] = [9, 10, 11];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// No free slot is left.
    TableFull,
    InvalidLine,
    InvalidVector,
    /// The vector is handled by the dispatcher itself.
    Reserved,
    AlreadyRegistered,
}

#[derive(Clone, Copy)]
struct IrqHandler {
    callback: IrqCallback,
    context: usize,
    /// `None` until the device's line is known.
    line: Option<u8>,
}

/// Handlers for legacy IRQ lines. A line can be shared by several devices.
///
/// Slots are claimed in order and filled once; IRQ handlers are never removed.
pub struct IrqTable {
    handlers: [spin::Once<IrqHandler>; MAX_IRQ_HANDLERS],
    claimed: AtomicUsize,
}

impl IrqTable {
    pub const fn new() -> Self {
        Self {
            handlers: [const { spin::Once::new() }; MAX_IRQ_HANDLERS],
            claimed: AtomicUsize::new(0),
        }
    }

    /// Registers a handler for `line`, or for an unknown PCI line if `line` is `None`.
    pub fn register(
        &self,
        line: Option<u8>,
        callback: IrqCallback,
        context: usize,
    ) -> Result<(), RegisterError> {
        if line.is_some_and(|line| line >= IRQ_LINES) {
            return Err(RegisterError::InvalidLine);
        }
        let index = self
            .claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |claimed| {
                (claimed < MAX_IRQ_HANDLERS).then_some(claimed + 1)
            })
            .map_err(|_| RegisterError::TableFull)?;
        self.handlers[index].call_once(|| IrqHandler {
            callback,
            context,
            line,
        });
        log::debug!("registered IRQ handler {index} for line {line:?}");
        Ok(())
    }

    /// Runs the handlers for `line`. Returns true if any of them claimed the interrupt.
    ///
    /// Every handler registered for the line runs. If none claims it and the line is one
    /// PCI devices may use, handlers with an unknown line are tried until one does.
    /// A slot whose registration has not finished yet is skipped.
    pub fn dispatch(&self, line: u8) -> bool {
        let mut claimed = false;
        for handler in self.installed().filter(|handler| handler.line == Some(line)) {
            claimed |= (handler.callback)(line, handler.context);
        }
        if claimed || !PCI_IRQ_LINES.contains(&line) {
            return claimed;
        }

        self.installed()
            .filter(|handler| handler.line.is_none())
            .any(|handler| (handler.callback)(line, handler.context))
    }

    fn installed(&self) -> impl Iterator<Item = &IrqHandler> {
        let claimed = self.claimed.load(Ordering::Acquire).min(MAX_IRQ_HANDLERS);
        self.handlers[..claimed].iter().filter_map(spin::Once::get)
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A vector allocated to a message-signalled interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiVector {
    pub index: u8,
    /// What the device must write in its MSI data register.
    pub vector: Vector,
}

const SLOT_FREE: u8 = 0;
const SLOT_CLAIMED: u8 = 1;
const SLOT_READY: u8 = 2;

struct MsiSlot {
    state: AtomicU8,
    callback: AtomicPtr<()>,
    context: AtomicUsize,
}

impl MsiSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_FREE),
            callback: AtomicPtr::new(core::ptr::null_mut()),
            context: AtomicUsize::new(0),
        }
    }
}

/// One handler per MSI vector.
pub struct MsiTable {
    slots: [MsiSlot; MSI_COUNT as usize],
}

impl MsiTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { MsiSlot::new() }; MSI_COUNT as usize],
        }
    }

    /// Allocates a vector and installs `callback` for it.
    pub fn register(&self, callback: MsiCallback, context: usize) -> Result<MsiVector, RegisterError> {
        let index = self
            .slots
            .iter()
            .position(|slot| {
                slot.state
                    .compare_exchange(SLOT_FREE, SLOT_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            })
            .ok_or(RegisterError::TableFull)?;
        let slot = &self.slots[index];
        slot.callback.store(callback as *mut (), Ordering::Relaxed);
        slot.context.store(context, Ordering::Relaxed);
        slot.state.store(SLOT_READY, Ordering::Release);

        let index = index as u8;
        Ok(MsiVector {
            index,
            vector: Vector::msi(index),
        })
    }

    /// Frees the vector. The device must have stopped raising it.
    pub fn unregister(&self, msi: MsiVector) {
        let previous = self.slots[usize::from(msi.index)]
            .state
            .swap(SLOT_FREE, Ordering::AcqRel);
        if previous != SLOT_READY {
            log::warn!("unregistering MSI {} which has no handler", msi.index);
        }
    }

    /// Runs the handler of slot `index`. Returns false if there is none.
    pub fn dispatch(&self, index: u8) -> bool {
        let slot = &self.slots[usize::from(index)];
        if slot.state.load(Ordering::Acquire) != SLOT_READY {
            return false;
        }
        let callback = slot.callback.load(Ordering::Relaxed);
        let context = slot.context.load(Ordering::Relaxed);
        // SAFETY: a ready slot holds a `MsiCallback` cast in `register`.
        let callback = unsafe { core::mem::transmute::<*mut (), MsiCallback>(callback) };
        callback(index, context);
        true
    }
}

impl Default for MsiTable {
    fn default() -> Self {
        Self::new()
    }
}

const IPI_SLOTS: usize = (IPI_END - IPI_BASE) as usize;

/// One callback per IPI vector, set once and read without locking.
pub struct IpiTable {
    callbacks: [spin::Once<IpiCallback>; IPI_SLOTS],
}

impl IpiTable {
    pub const fn new() -> Self {
        Self {
            callbacks: [const { spin::Once::new() }; IPI_SLOTS],
        }
    }

    pub fn register(&self, vector: Vector, callback: IpiCallback) -> Result<(), RegisterError> {
        if vector == Vector::CALL_FUNCTION || vector == Vector::TLB_SHOOTDOWN {
            return Err(RegisterError::Reserved);
        }
        let slot = self.slot(vector).ok_or(RegisterError::InvalidVector)?;
        let mut installed = false;
        slot.call_once(|| {
            installed = true;
            callback
        });
        if installed {
            Ok(())
        } else {
            Err(RegisterError::AlreadyRegistered)
        }
    }

    /// Runs the callback for `vector`. Returns false if none is registered.
    pub fn dispatch(&self, vector: Vector) -> bool {
        match self.slot(vector).and_then(spin::Once::get) {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn slot(&self, vector: Vector) -> Option<&spin::Once<IpiCallback>> {
        let value = vector.value();
        if (IPI_BASE..IPI_END).contains(&value) {
            Some(&self.callbacks[usize::from(value - IPI_BASE)])
        } else {
            None
        }
    }
}

impl Default for IpiTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn claims(_line: u8, context: usize) -> bool {
        context != 0
    }

    fn declines(_line: u8, _context: usize) -> bool {
        false
    }

    fn count_msi(_index: u8, context: usize) {
        // SAFETY: tests pass the address of a live AtomicUsize.
        let counter = unsafe { &*(context as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn count_ipi() {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn irq_lines_are_validated() {
        let table = IrqTable::new();
        assert_eq!(table.register(Some(0x20), claims, 1), Err(RegisterError::InvalidLine));
        assert_eq!(table.register(Some(0x1F), claims, 1), Ok(()));
    }

    #[test]
    fn irq_table_fills_up() {
        let table = IrqTable::new();
        for _ in 0..MAX_IRQ_HANDLERS {
            table.register(Some(1), declines, 0).unwrap();
        }
        assert_eq!(table.register(Some(1), declines, 0), Err(RegisterError::TableFull));
    }

    #[test]
    fn known_lines_dispatch_to_their_handlers() {
        let table = IrqTable::new();
        table.register(Some(4), declines, 0).unwrap();
        table.register(Some(4), claims, 1).unwrap();
        assert!(table.dispatch(4));
        assert!(!table.dispatch(5));
    }

    #[test]
    fn unknown_lines_only_for_pci_lines() {
        let table = IrqTable::new();
        table.register(None, declines, 0).unwrap();
        table.register(None, claims, 1).unwrap();
        assert!(table.dispatch(10));
        assert!(!table.dispatch(3));
    }

    #[test]
    fn msi_vectors_are_allocated_and_freed() {
        let table = MsiTable::new();
        let calls = AtomicUsize::new(0);
        let context = &calls as *const AtomicUsize as usize;

        let first = table.register(count_msi, context).unwrap();
        let second = table.register(count_msi, context).unwrap();
        assert_eq!(first.vector, Vector::new(0x70));
        assert_eq!(second.vector, Vector::new(0x71));

        assert!(table.dispatch(second.index));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        table.unregister(first);
        assert!(!table.dispatch(first.index));
        assert_eq!(table.register(count_msi, context).unwrap(), first);
    }

    #[test]
    fn msi_table_fills_up() {
        let table = MsiTable::new();
        for _ in 0..MSI_COUNT {
            table.register(count_msi, 0).unwrap();
        }
        assert_eq!(table.register(count_msi, 0), Err(RegisterError::TableFull));
    }

    #[test]
    fn irq_dispatch_skips_a_registration_in_progress() {
        use core::sync::atomic::AtomicBool;

        let table = IrqTable::new();
        let filling = AtomicBool::new(false);
        let release = AtomicBool::new(false);

        std::thread::scope(|scope| {
            // Claim slot 0 and stall while filling it, as an interrupted registration would.
            table.claimed.store(1, Ordering::SeqCst);
            let registering = scope.spawn(|| {
                table.handlers[0].call_once(|| {
                    filling.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        core::hint::spin_loop();
                    }
                    IrqHandler {
                        callback: claims,
                        context: 1,
                        line: Some(4),
                    }
                });
            });
            while !filling.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }

            assert!(!table.dispatch(4));
            table.register(Some(4), claims, 1).unwrap();
            assert!(table.dispatch(4));

            release.store(true, Ordering::SeqCst);
            registering.join().unwrap();
        });
        assert_eq!(table.installed().count(), 2);
    }

    #[test]
    fn msi_dispatch_skips_a_registration_in_progress() {
        let table = MsiTable::new();
        let calls = AtomicUsize::new(0);
        let context = &calls as *const AtomicUsize as usize;

        table.slots[0].state.store(SLOT_CLAIMED, Ordering::SeqCst);
        assert!(!table.dispatch(0));

        let msi = table.register(count_msi, context).unwrap();
        assert_eq!(msi.index, 1);
        assert!(table.dispatch(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ipi_callbacks_register_once() {
        let table = IpiTable::new();
        let vector = Vector::new(0xF5);
        assert!(!table.dispatch(vector));
        assert_eq!(table.register(vector, count_ipi), Ok(()));
        assert_eq!(table.register(vector, count_ipi), Err(RegisterError::AlreadyRegistered));
        assert_eq!(table.register(Vector::new(0xFE), count_ipi), Err(RegisterError::InvalidVector));
        assert_eq!(table.register(Vector::TLB_SHOOTDOWN, count_ipi), Err(RegisterError::Reserved));

        let before = CALLS.load(Ordering::SeqCst);
        assert!(table.dispatch(vector));
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
    }
}
