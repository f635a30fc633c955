//! Running a function on every processor.

use core::sync::atomic::{AtomicPtr, Ordering};

use vmm::{CALL_FUNCTION_IPI, IpiChannel, IpiSender};

/// The function published for the current call-function broadcast.
pub struct FunctionCall {
    callback: AtomicPtr<()>,
}

impl FunctionCall {
    pub const fn new() -> Self {
        Self {
            callback: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Runs `callback` on every processor, the caller included, and returns once all of
    /// them have finished.
    pub fn call_on_all(&self, channel: &IpiChannel, sender: &dyn IpiSender, callback: fn()) {
        let guard = channel.lock(sender);
        self.callback.store(callback as *mut (), Ordering::Release);
        guard.broadcast_and_wait(CALL_FUNCTION_IPI, sender);
        callback();
        self.callback.store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Interrupt handler body for [`CALL_FUNCTION_IPI`].
    ///
    /// # Panics
    ///
    /// Panics if no function has been published.
    pub fn handle_ipi(&self, channel: &IpiChannel) {
        let callback = self.callback.load(Ordering::Acquire);
        if callback.is_null() {
            panic!("call-function IPI with no function published");
        }
        // SAFETY: the only non-null value ever stored is a `fn()` cast in `call_on_all`.
        let callback = unsafe { core::mem::transmute::<*mut (), fn()>(callback) };
        callback();
        channel.acknowledge();
    }
}

impl Default for FunctionCall {
    fn default() -> Self {
        Self::new()
    }
}

static FUNCTION_CALL: FunctionCall = FunctionCall::new();

pub const fn function_call() -> &'static FunctionCall {
    &FUNCTION_CALL
}

/// Runs `callback` on every processor through the system-wide IPI channel.
pub fn call_on_all_processors(sender: &dyn IpiSender, callback: fn()) {
    FUNCTION_CALL.call_on_all(vmm::ipi_channel(), sender, callback);
}

pub fn handle_call_function_ipi() {
    FUNCTION_CALL.handle_ipi(vmm::ipi_channel());
}
