//! Inter-processor interrupt rendezvous.
//!
//! Only one broadcast may be in flight at a time. The initiator takes the [`IpiChannel`]
//! lock, publishes its request, signals every other processor and spins until each of them
//! has acknowledged. Receivers acknowledge from their interrupt handler once the request
//! has been carried out.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Runs the function published through the IPI channel.
pub const CALL_FUNCTION_IPI: u8 = 0xF0;
/// Invalidates the range published in the shootdown state.
pub const TLB_SHOOTDOWN_IPI: u8 = 0xF1;

/// Sends inter-processor interrupts.
pub trait IpiSender: Sync {
    /// Number of processors in the system, including the caller.
    fn processor_count(&self) -> usize;

    /// Sends `vector` to every other processor.
    ///
    /// Returns how many processors were *not* signalled, counting the caller.
    fn broadcast(&self, vector: u8) -> usize;

    /// Delivers IPIs pending for the calling processor.
    ///
    /// Hardware delivers them as interrupts while the caller spins (the IPI vectors sit
    /// above the priority spinlocks raise to), so by default this does nothing.
    fn poll(&self) {}
}

/// The lock and acknowledgement counter shared by every IPI broadcast.
pub struct IpiChannel {
    lock: spin::Mutex<()>,
    remaining: AtomicUsize,
}

impl IpiChannel {
    pub const fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
            remaining: AtomicUsize::new(0),
        }
    }

    /// Takes the channel, delivering IPIs sent to the caller while it waits.
    pub fn lock<'a>(&'a self, sender: &dyn IpiSender) -> IpiGuard<'a> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            sender.poll();
            core::hint::spin_loop();
        }
    }

    pub fn try_lock(&self) -> Option<IpiGuard<'_>> {
        self.lock.try_lock().map(|guard| IpiGuard {
            channel: self,
            _guard: guard,
        })
    }

    /// Called by a receiver once it has handled the broadcast.
    ///
    /// # Panics
    ///
    /// Panics if no broadcast is waiting for acknowledgements.
    pub fn acknowledge(&self) {
        if self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            panic!("IPI acknowledged with no broadcast in flight");
        }
    }

    /// Number of acknowledgements the current broadcast still waits for.
    pub fn pending(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl Default for IpiChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive use of an [`IpiChannel`].
pub struct IpiGuard<'a> {
    channel: &'a IpiChannel,
    _guard: spin::MutexGuard<'a, ()>,
}

impl IpiGuard<'_> {
    pub fn channel(&self) -> &IpiChannel {
        self.channel
    }

    /// Sends `vector` to every other processor and waits until each one signalled has
    /// acknowledged it.
    ///
    /// Returns immediately on a single-processor system.
    pub fn broadcast_and_wait(&self, vector: u8, sender: &dyn IpiSender) {
        let count = sender.processor_count();
        if count <= 1 {
            return;
        }

        let remaining = &self.channel.remaining;
        remaining.store(count, Ordering::Release);
        let skipped = sender.broadcast(vector);
        remaining.fetch_sub(skipped, Ordering::AcqRel);

        while remaining.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
        log::trace!("IPI {vector:#x} acknowledged by {} processors", count - skipped);
    }
}
