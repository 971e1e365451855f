//! Memory management implementation
//!
//! SV39 page-based virtual-memory architecture for RV64 systems: the frame
//! allocator, page tables, the kernel and per-process address spaces,
//! copy-on-write fork, mmap regions and page-fault handling.
//!
//! Every task or process has a memory_set to control its virtual memory.

mod address;
mod address_space;
pub mod cow;
pub mod fault;
mod frame_allocator;
mod memory_set;
mod page_table;
pub mod vma;

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use address_space::{AddressSpace, KernelSpace, USER_ROOT_ENTRIES};
pub use fault::{AccessKind, FaultError, FaultResolution};
pub use frame_allocator::{FrameAllocator, FrameReclaimer, FrameTracker};
pub use memory_set::{MapPermission, MemorySet};
pub use page_table::{PTEFlags, PageTable, PageTableEntry, PteState};

use alloc::sync::Arc;
use lazy_static::*;
use spin::Once;

lazy_static! {
    /// frame allocator instance through lazy_static!
    pub static ref FRAME_ALLOCATOR: Arc<FrameAllocator> = Arc::new(FrameAllocator::new());
}

static KERNEL_SPACE: Once<Arc<KernelSpace>> = Once::new();

/// Hands `[start, end)` to the global frame allocator and builds the kernel
/// space on top of it.
///
/// # Safety
///
/// The range must be free RAM reachable at its physical address, and this
/// must be called only once.
pub unsafe fn init(start: PhysAddr, end: PhysAddr) -> &'static Arc<KernelSpace> {
    FRAME_ALLOCATOR.init(start, end);
    KERNEL_SPACE.call_once(|| match KernelSpace::new(FRAME_ALLOCATOR.clone()) {
        Ok(kernel) => Arc::new(kernel),
        Err(e) => panic!("kernel space: {}", e),
    })
}

/// The kernel space built by [`init`], if it has run.
pub fn kernel_space() -> Option<&'static Arc<KernelSpace>> {
    KERNEL_SPACE.get()
}
