//! Page fault classification.
//!
//! The architecture layer resolves faults in the windows it owns itself (the low memory
//! map and the core region array) and forwards everything else to the memory manager with
//! the address space the fault belongs to.

use bitflags::bitflags;

use crate::{
    AddressSpace, AllocFlags, MapError, MapFlags, MapOutcome, PAGE_SIZE, PhysicalAddress,
    PhysicalAllocator, VirtualAddress,
    layout::{LOW_MEMORY_MAP_START, Window},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The faulting access was a write.
        const WRITE = 1 << 0;
        /// The fault happened in kernel mode.
        const FOR_SUPERVISOR = 1 << 1;
    }
}

/// A fault handed on to the memory manager.
#[derive(Clone, Copy)]
pub struct FaultRequest<'a> {
    pub space: &'a AddressSpace,
    pub window: Window,
    /// The faulting page.
    pub address: VirtualAddress,
    pub flags: FaultFlags,
}

/// The region-level memory manager sitting above this layer.
pub trait MemoryManager: Sync {
    /// Tries to make the faulting page accessible. Returns false if the access is invalid.
    fn handle_page_fault(&self, request: FaultRequest<'_>) -> bool;
}

/// The thread that took the fault.
pub trait FaultingThread {
    /// A space the thread has borrowed, which takes precedence over its process's space.
    fn temporary_space(&self) -> Option<&AddressSpace>;
    fn process_space(&self) -> &AddressSpace;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultError {
    NonCanonical,
    /// The first page, which is never mapped.
    NullPage,
    /// A user address faulted with no current thread.
    NoThread,
    /// The address is in no window the faulting mode may use.
    OutsideWindows,
    /// The memory manager declined the fault.
    Unhandled,
    OutOfMemory,
}

impl From<MapError> for PageFaultError {
    fn from(error: MapError) -> Self {
        match error {
            MapError::OutOfMemory => PageFaultError::OutOfMemory,
            MapError::InvalidAddress | MapError::WrongHalf => PageFaultError::OutsideWindows,
        }
    }
}

/// Routes page faults to whoever can resolve them.
pub struct FaultClassifier<'a> {
    kernel: &'a AddressSpace,
    allocator: &'a dyn PhysicalAllocator,
    manager: &'a dyn MemoryManager,
}

impl<'a> FaultClassifier<'a> {
    pub fn new(
        kernel: &'a AddressSpace,
        allocator: &'a dyn PhysicalAllocator,
        manager: &'a dyn MemoryManager,
    ) -> Self {
        Self {
            kernel,
            allocator,
            manager,
        }
    }

    /// Resolves a fault at `address` (the value of CR2).
    ///
    /// `thread` is the current thread, if the processor is running one.
    pub fn handle(
        &self,
        address: usize,
        flags: FaultFlags,
        thread: Option<&dyn FaultingThread>,
    ) -> Result<(), PageFaultError> {
        let address = VirtualAddress::try_new(address).ok_or(PageFaultError::NonCanonical)?;
        let page = address.align_down(PAGE_SIZE);
        let window = Window::containing(address);
        let supervisor = flags.contains(FaultFlags::FOR_SUPERVISOR);

        match window {
            Some(Window::NullGuard) => Err(PageFaultError::NullPage),
            Some(Window::LowMemory) if supervisor => self.map_low_memory(page),
            Some(Window::CoreRegions) if supervisor => self.populate_core_regions(page),
            Some(window @ (Window::CoreSpace | Window::KernelSpace | Window::Modules))
                if supervisor =>
            {
                self.forward(self.kernel, window, page, flags)
            }
            _ => {
                let thread = thread.ok_or(PageFaultError::NoThread)?;
                let space = thread
                    .temporary_space()
                    .unwrap_or_else(|| thread.process_space());
                match window {
                    Some(Window::User) => self.forward(space, Window::User, page, flags),
                    _ => {
                        log::debug!("fault at {address} outside any usable window ({flags:?})");
                        Err(PageFaultError::OutsideWindows)
                    }
                }
            }
        }
    }

    fn map_low_memory(&self, page: VirtualAddress) -> Result<(), PageFaultError> {
        let physical = PhysicalAddress::new(page.as_usize() - LOW_MEMORY_MAP_START);
        self.kernel.map_page(
            self.allocator,
            physical,
            page,
            MapFlags::NOT_CACHEABLE | MapFlags::IGNORE_IF_MAPPED,
        )?;
        Ok(())
    }

    fn populate_core_regions(&self, page: VirtualAddress) -> Result<(), PageFaultError> {
        let frame = self
            .allocator
            .allocate(AllocFlags::ZEROED)
            .ok_or(PageFaultError::OutOfMemory)?;
        match self
            .kernel
            .map_page(self.allocator, frame, page, MapFlags::IGNORE_IF_MAPPED)
        {
            Ok(MapOutcome::Mapped) | Ok(MapOutcome::Remapped) => Ok(()),
            Ok(MapOutcome::AlreadyMapped) => {
                // Another processor populated the page first.
                self.allocator.free(frame);
                Ok(())
            }
            Err(error) => {
                self.allocator.free(frame);
                Err(error.into())
            }
        }
    }

    fn forward(
        &self,
        space: &AddressSpace,
        window: Window,
        page: VirtualAddress,
        flags: FaultFlags,
    ) -> Result<(), PageFaultError> {
        let request = FaultRequest {
            space,
            window,
            address: page,
            flags,
        };
        if self.manager.handle_page_fault(request) {
            Ok(())
        } else {
            Err(PageFaultError::Unhandled)
        }
    }
}
