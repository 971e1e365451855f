//! User page-fault resolution.
//!
//! A fault is tried, in order, as a copy-on-write write, as the first touch
//! of an mmap region and as the first touch of a lazily grown heap page.
//! Whatever none of them claims is fatal for the process.

use super::cow::{self, CowOutcome};
use super::vma::{Region, RegionTable, VmProt};
use super::{AddressSpace, PTEFlags, VirtAddr};
use crate::config::{LAZY_FLOOR, MAXUVA, PAGE_SIZE};
use core::fmt;

/// Kind of access that trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// load
    Read,
    /// store or AMO
    Write,
    /// instruction fetch
    Execute,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A shared page was copied or made writable.
    CopyOnWrite(CowOutcome),
    /// A region page was populated.
    Region,
    /// A heap page was populated.
    LazyHeap,
}

/// Why a fault could not be resolved. Each of these kills the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No frame for the new page.
    OutOfMemory {
        /// faulting address
        va: usize,
    },
    /// The page exists but does not allow the access.
    Protection {
        /// faulting address
        va: usize,
        /// what was attempted
        access: AccessKind,
    },
    /// Nothing is supposed to live at this address.
    Segfault {
        /// faulting address
        va: usize,
        /// what was attempted
        access: AccessKind,
    },
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::OutOfMemory { va } => write!(f, "out of memory at {:#x}", va),
            FaultError::Protection { va, access } => {
                write!(f, "{:?} access to {:#x} not permitted", access, va)
            }
            FaultError::Segfault { va, access } => {
                write!(f, "{:?} access to unmapped {:#x}", access, va)
            }
        }
    }
}

/// Resolves a fault at `va` in a process whose heap ends at `sz`.
pub fn handle_page_fault(
    space: &mut AddressSpace,
    regions: &RegionTable,
    sz: usize,
    va: usize,
    access: AccessKind,
) -> Result<FaultResolution, FaultError> {
    if access == AccessKind::Write {
        match cow::resolve_write(space, VirtAddr(va)) {
            Ok(CowOutcome::NotCow) => {}
            Ok(outcome) => return Ok(FaultResolution::CopyOnWrite(outcome)),
            Err(_) => return Err(FaultError::OutOfMemory { va }),
        }
    }
    if let Some(region) = regions.find(va) {
        return populate_region(space, region, va, access).map(|_| FaultResolution::Region);
    }
    if va >= LAZY_FLOOR && va < sz && va < MAXUVA {
        if space.translate(VirtAddr(va).floor()).is_some() {
            return Err(FaultError::Protection { va, access });
        }
        populate(space, va, PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U, |_| {})?;
        return Ok(FaultResolution::LazyHeap);
    }
    Err(FaultError::Segfault { va, access })
}

fn populate_region(space: &mut AddressSpace, region: &Region, va: usize, access: AccessKind) -> Result<(), FaultError> {
    let needed = match access {
        AccessKind::Read => VmProt::READ,
        AccessKind::Write => VmProt::WRITE,
        AccessKind::Execute => VmProt::EXEC,
    };
    if !region.prot.contains(needed) || space.translate(VirtAddr(va).floor()).is_some() {
        return Err(FaultError::Protection { va, access });
    }
    let page_va = va - va % PAGE_SIZE;
    populate(space, va, region.page_flags(), |page| {
        if let Some((file, offset)) = region.file_offset(page_va) {
            file.read_at(offset, page);
        }
    })
}

/// Maps a zeroed frame at `va`'s page after `fill` has initialized it.
fn populate(
    space: &mut AddressSpace,
    va: usize,
    flags: PTEFlags,
    fill: impl FnOnce(&mut [u8]),
) -> Result<(), FaultError> {
    let allocator = space.allocator().clone();
    let frame = allocator.alloc_frame().ok_or(FaultError::OutOfMemory { va })?;
    frame.zero();
    fill(frame.ppn.get_bytes_array());
    space
        .map_page(VirtAddr(va).floor(), frame.ppn, flags)
        .map_err(|_| FaultError::OutOfMemory { va })?;
    frame.leak();
    space.flush_tlb();
    Ok(())
}
