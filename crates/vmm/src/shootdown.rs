//! TLB invalidation, locally and across processors.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    IpiChannel, IpiGuard, IpiSender, PAGE_SIZE, TLB_SHOOTDOWN_IPI, VirtualAddress, arch,
};

/// Above this many pages the whole TLB is flushed instead.
pub const FULL_FLUSH_THRESHOLD: usize = 1024;

/// Something that can drop stale translations for a range of pages.
pub trait TlbInvalidator {
    fn invalidate(&self, start: VirtualAddress, pages: usize);
}

/// Invalidates on the calling processor only.
///
/// Enough for spaces no other processor can have loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInvalidator;

impl TlbInvalidator for LocalInvalidator {
    fn invalidate(&self, start: VirtualAddress, pages: usize) {
        invalidate_local(start, pages);
    }
}

fn invalidate_local(start: VirtualAddress, pages: usize) {
    if pages > FULL_FLUSH_THRESHOLD {
        arch::invalidate_all();
    } else {
        for page in 0..pages {
            arch::invalidate_page(start + page * PAGE_SIZE);
        }
    }
}

/// The range the current shootdown broadcast asks receivers to invalidate.
pub struct TlbShootdown {
    start: AtomicUsize,
    pages: AtomicUsize,
}

impl TlbShootdown {
    pub const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
        }
    }

    /// Invalidates the range on every processor, the caller included.
    ///
    /// The guard proves the caller owns the channel, so the published range cannot be
    /// overwritten before every receiver has read it.
    pub fn invalidate_range(
        &self,
        guard: &IpiGuard<'_>,
        sender: &dyn IpiSender,
        start: VirtualAddress,
        pages: usize,
    ) {
        self.start.store(start.as_usize(), Ordering::Release);
        self.pages.store(pages, Ordering::Release);
        guard.broadcast_and_wait(TLB_SHOOTDOWN_IPI, sender);
        invalidate_local(start, pages);
    }

    /// The receiving side of [`TLB_SHOOTDOWN_IPI`].
    pub fn handle_ipi(&self, channel: &IpiChannel) {
        let start = VirtualAddress::new(self.start.load(Ordering::Acquire));
        let pages = self.pages.load(Ordering::Acquire);
        invalidate_local(start, pages);
        channel.acknowledge();
    }
}

impl Default for TlbShootdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Invalidates on every processor through an IPI broadcast.
pub struct Shootdown<'a> {
    channel: &'a IpiChannel,
    state: &'a TlbShootdown,
    sender: &'a dyn IpiSender,
}

impl<'a> Shootdown<'a> {
    pub fn new(channel: &'a IpiChannel, state: &'a TlbShootdown, sender: &'a dyn IpiSender) -> Self {
        Self {
            channel,
            state,
            sender,
        }
    }

    /// Uses the system-wide channel and shootdown state.
    pub fn global(sender: &'a dyn IpiSender) -> Self {
        Self::new(ipi_channel(), tlb_shootdown(), sender)
    }
}

impl TlbInvalidator for Shootdown<'_> {
    fn invalidate(&self, start: VirtualAddress, pages: usize) {
        let guard = self.channel.lock(self.sender);
        self.state.invalidate_range(&guard, self.sender, start, pages);
    }
}

static IPI_CHANNEL: IpiChannel = IpiChannel::new();
static TLB_SHOOTDOWN: TlbShootdown = TlbShootdown::new();

/// The channel every broadcast in the system goes through.
pub const fn ipi_channel() -> &'static IpiChannel {
    &IPI_CHANNEL
}

pub const fn tlb_shootdown() -> &'static TlbShootdown {
    &TLB_SHOOTDOWN
}

/// Interrupt handler body for [`TLB_SHOOTDOWN_IPI`].
pub fn handle_shootdown_ipi() {
    TLB_SHOOTDOWN.handle_ipi(&IPI_CHANNEL);
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{Invalidation, take_invalidations, testing::SimulatedProcessors};

    fn pages(start: usize, count: usize) -> Vec<Invalidation> {
        (0..count)
            .map(|page| Invalidation::Page(VirtualAddress::new(start + page * PAGE_SIZE)))
            .collect()
    }

    #[test]
    fn small_ranges_invalidate_each_page() {
        take_invalidations();
        LocalInvalidator.invalidate(VirtualAddress::new(0x1000), FULL_FLUSH_THRESHOLD);
        let log = take_invalidations();
        assert_eq!(log.len(), FULL_FLUSH_THRESHOLD);
        assert_eq!(log[0], Invalidation::Page(VirtualAddress::new(0x1000)));
    }

    #[test]
    fn large_ranges_flush_everything() {
        take_invalidations();
        LocalInvalidator.invalidate(VirtualAddress::new(0x1000), FULL_FLUSH_THRESHOLD + 1);
        assert_eq!(take_invalidations(), [Invalidation::All]);
    }

    #[test]
    fn single_processor_invalidates_locally() {
        take_invalidations();
        let machine = SimulatedProcessors::new(1);
        let ignore = |_vector: u8| {};
        let cpu = machine.processor(0, &ignore);
        let (channel, state) = (IpiChannel::new(), TlbShootdown::new());

        Shootdown::new(&channel, &state, &cpu).invalidate(VirtualAddress::new(0x2000), 2);
        assert_eq!(take_invalidations(), pages(0x2000, 2));
    }

    #[test]
    fn concurrent_shootdowns_reach_every_processor() {
        const CPUS: usize = 3;
        let ranges = [(0x1000, 2), (0x10_0000, 3)];
        let machine = SimulatedProcessors::new(CPUS);
        let channel = IpiChannel::new();
        let state = TlbShootdown::new();
        let finished = AtomicUsize::new(0);

        let logs: Vec<Vec<Invalidation>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..CPUS)
                .map(|id| {
                    let (machine, channel, state, finished) =
                        (&machine, &channel, &state, &finished);
                    scope.spawn(move || {
                        take_invalidations();
                        let handler = |vector: u8| {
                            assert_eq!(vector, TLB_SHOOTDOWN_IPI);
                            state.handle_ipi(channel);
                        };
                        let cpu = machine.processor(id, &handler);

                        if let Some(&(start, count)) = ranges.get(id) {
                            Shootdown::new(channel, state, &cpu)
                                .invalidate(VirtualAddress::new(start), count);
                            finished.fetch_add(1, Ordering::SeqCst);
                        }
                        while finished.load(Ordering::SeqCst) < ranges.len() {
                            cpu.service();
                            core::hint::spin_loop();
                        }
                        take_invalidations()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect()
        });

        let (a, b) = (pages(ranges[0].0, ranges[0].1), pages(ranges[1].0, ranges[1].1));
        for (id, log) in logs.iter().enumerate() {
            let a_then_b = [a.as_slice(), b.as_slice()].concat();
            let b_then_a = [b.as_slice(), a.as_slice()].concat();
            assert!(
                *log == a_then_b || *log == b_then_a,
                "processor {id} saw {log:?}"
            );
        }
        assert_eq!(channel.pending(), 0);
    }
}
