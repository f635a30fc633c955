//! An emulated machine for exercising the memory layer on a host.
//!
//! Each host thread is one emulated processor with its own physical memory (see
//! [`AddressTranslator::emulated`]). [`EmulatedFrameAllocator`] hands out frames of that
//! memory with a configurable commit limit, and [`SimulatedProcessors`] routes
//! inter-processor interrupts between threads.

use core::sync::atomic::{AtomicBool, Ordering};
use std::vec::Vec;

use crate::{
    AddressTranslator, AllocFlags, IpiSender, PAGE_SIZE, PhysicalAddress, PhysicalAllocator,
};

/// Frames of emulated memory given to every test thread.
pub const EMULATED_FRAMES: usize = 4096;

/// Installs emulated physical memory for the calling thread, if it has none yet.
pub fn setup() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_FRAMES));
    }
}

/// Returns a pointer to the bytes of an emulated frame.
pub fn frame_ptr(frame: PhysicalAddress) -> *mut u8 {
    AddressTranslator::current().phys_to_ptr(frame)
}

/// Fills an emulated frame with `byte`.
pub fn fill_frame(frame: PhysicalAddress, byte: u8) {
    // SAFETY: the frame lies inside the emulated memory and is page sized.
    unsafe { core::ptr::write_bytes(frame_ptr(frame), byte, PAGE_SIZE) };
}

/// Returns true if every byte of the frame is zero.
pub fn frame_is_zeroed(frame: PhysicalAddress) -> bool {
    // SAFETY: the frame lies inside the emulated memory and is page sized.
    let bytes = unsafe { core::slice::from_raw_parts(frame_ptr(frame), PAGE_SIZE) };
    bytes.iter().all(|&b| b == 0)
}

struct AllocatorState {
    next: usize,
    limit: usize,
    free: Vec<PhysicalAddress>,
    committed: usize,
    commit_limit: usize,
    in_use: usize,
    allocations: usize,
}

/// A frame allocator over the calling thread's emulated memory.
///
/// Frame 0 is never handed out. Freed frames are reused most recent first, and keep their
/// contents unless the caller asks for [`AllocFlags::ZEROED`].
pub struct EmulatedFrameAllocator {
    state: spin::Mutex<AllocatorState>,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator over all emulated frames with an unlimited commit budget.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no emulated memory (see [`setup`]).
    pub fn new() -> Self {
        let limit = AddressTranslator::current()
            .emulated_memory()
            .map(|memory| memory.frames())
            .unwrap_or_else(|| panic!("frame allocator requires emulated memory"));
        Self {
            state: spin::Mutex::new(AllocatorState {
                next: 1,
                limit,
                free: Vec::new(),
                committed: 0,
                commit_limit: usize::MAX,
                in_use: 0,
                allocations: 0,
            }),
        }
    }

    /// Creates an allocator whose commit budget holds at most `pages` frames.
    pub fn with_commit_limit(pages: usize) -> Self {
        let allocator = Self::new();
        allocator.set_commit_limit(pages);
        allocator
    }

    /// Creates an allocator that hands out frames below `frames` only.
    pub fn with_frame_limit(frames: usize) -> Self {
        let allocator = Self::new();
        {
            let mut state = allocator.state.lock();
            state.limit = state.limit.min(frames);
        }
        allocator
    }

    pub fn set_commit_limit(&self, pages: usize) {
        self.state.lock().commit_limit = pages;
    }

    /// Returns the number of frames currently committed.
    pub fn committed(&self) -> usize {
        self.state.lock().committed
    }

    /// Returns the number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Returns the number of successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }
}

impl Default for EmulatedFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalAllocator for EmulatedFrameAllocator {
    fn allocate(&self, flags: AllocFlags) -> Option<PhysicalAddress> {
        let frame = {
            let mut state = self.state.lock();
            let frame = match state.free.pop() {
                Some(frame) => frame,
                None if state.next < state.limit => {
                    state.next += 1;
                    PhysicalAddress::new((state.next - 1) * PAGE_SIZE)
                }
                None => return None,
            };
            state.in_use += 1;
            state.allocations += 1;
            frame
        };

        if flags.contains(AllocFlags::ZEROED) {
            fill_frame(frame, 0);
        }
        Some(frame)
    }

    fn free(&self, frame: PhysicalAddress) {
        assert!(
            frame.is_aligned(PAGE_SIZE) && frame.as_usize() != 0,
            "freeing invalid frame {frame}"
        );
        let mut state = self.state.lock();
        assert!(!state.free.contains(&frame), "double free of frame {frame}");
        state.in_use -= 1;
        state.free.push(frame);
    }

    fn commit(&self, pages: usize) -> bool {
        let mut state = self.state.lock();
        match state.committed.checked_add(pages) {
            Some(total) if total <= state.commit_limit => {
                state.committed = total;
                true
            }
            _ => false,
        }
    }

    fn decommit(&self, pages: usize) {
        let mut state = self.state.lock();
        state.committed = state
            .committed
            .checked_sub(pages)
            .unwrap_or_else(|| panic!("decommitting {pages} pages more than committed"));
    }
}

struct Mailbox {
    online: AtomicBool,
    pending: spin::Mutex<Vec<u8>>,
}

/// A set of emulated processors that exchange IPIs through per-processor mailboxes.
///
/// Each host thread plays one processor and must call [`SimulatedProcessor::service`]
/// regularly, which stands in for taking the interrupt.
pub struct SimulatedProcessors {
    mailboxes: Vec<Mailbox>,
}

impl SimulatedProcessors {
    pub fn new(count: usize) -> Self {
        Self {
            mailboxes: (0..count)
                .map(|_| Mailbox {
                    online: AtomicBool::new(true),
                    pending: spin::Mutex::new(Vec::new()),
                })
                .collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Marks a processor as (not) accepting IPIs.
    pub fn set_online(&self, id: usize, online: bool) {
        self.mailboxes[id].online.store(online, Ordering::SeqCst);
    }

    /// Number of IPIs waiting for processor `id`.
    pub fn pending(&self, id: usize) -> usize {
        self.mailboxes[id].pending.lock().len()
    }

    /// Returns the handle processor `id` uses to send and receive IPIs.
    ///
    /// `handler` runs for every vector delivered to it.
    pub fn processor<'a>(
        &'a self,
        id: usize,
        handler: &'a (dyn Fn(u8) + Sync),
    ) -> SimulatedProcessor<'a> {
        assert!(id < self.count(), "no processor {id}");
        SimulatedProcessor {
            id,
            machine: self,
            handler,
        }
    }
}

/// One processor of a [`SimulatedProcessors`] set.
pub struct SimulatedProcessor<'a> {
    id: usize,
    machine: &'a SimulatedProcessors,
    handler: &'a (dyn Fn(u8) + Sync),
}

impl SimulatedProcessor<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs the handler for every IPI delivered so far. Returns how many ran.
    pub fn service(&self) -> usize {
        let pending = core::mem::take(&mut *self.machine.mailboxes[self.id].pending.lock());
        for &vector in &pending {
            (self.handler)(vector);
        }
        pending.len()
    }
}

impl IpiSender for SimulatedProcessor<'_> {
    fn processor_count(&self) -> usize {
        self.machine.count()
    }

    fn broadcast(&self, vector: u8) -> usize {
        let mut skipped = 0;
        for (id, mailbox) in self.machine.mailboxes.iter().enumerate() {
            if id == self.id || !mailbox.online.load(Ordering::SeqCst) {
                skipped += 1;
                continue;
            }
            mailbox.pending.lock().push(vector);
        }
        skipped
    }

    fn poll(&self) {
        self.service();
    }
}
