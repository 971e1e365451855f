//! Copy-on-write sharing between a parent and its forked child.

use super::{AddressSpace, PTEFlags, StepByOne, VirtAddr, VirtPageNum};
use crate::config::MAXVA;
use crate::error::VmError;

/// What a write fault on a possibly shared page turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOutcome {
    /// The page is not copy-on-write; someone else must handle the fault.
    NotCow,
    /// Last holder of the frame: it became writable in place.
    Promoted,
    /// The writer got a private copy and dropped its share of the original.
    Copied,
}

/// Shares the parent's user pages in `[0, sz)` with `child`.
///
/// Pages that are writable (or already copy-on-write) become read-only COW
/// in both spaces; read-only pages are shared as they are. Every shared
/// frame gains one reference. Pages the parent never touched are skipped.
/// On failure the child is emptied again and the parent's pages get back
/// write access where it is the sole holder.
pub fn fork_copy(parent: &mut AddressSpace, child: &mut AddressSpace, sz: usize) -> Result<(), VmError> {
    let end = VirtAddr(sz).ceil();
    let mut vpn = VirtPageNum(0);
    while vpn < end {
        if let Err(e) = share_page(parent, child, vpn) {
            warn!("fork: out of memory at {:?}, unwinding", vpn);
            child.unmap_pages(VirtPageNum(0), vpn.0, true);
            revert_cow(parent, vpn);
            parent.flush_tlb();
            return Err(e);
        }
        vpn.step();
    }
    parent.flush_tlb();
    Ok(())
}

fn share_page(parent: &mut AddressSpace, child: &mut AddressSpace, vpn: VirtPageNum) -> Result<(), VmError> {
    let pte = match parent.translate(vpn) {
        Some(pte) => pte,
        None => return Ok(()),
    };
    let (ppn, flags) = (pte.ppn(), pte.flags());
    let shared = if flags.intersects(PTEFlags::W | PTEFlags::COW) {
        (flags - PTEFlags::W) | PTEFlags::COW
    } else {
        flags
    };
    child.map_page(vpn, ppn, shared)?;
    parent.allocator().incref(ppn);
    if shared != flags {
        parent.remap_page(vpn, ppn, shared);
    }
    Ok(())
}

/// Gives write access back to COW pages below `end` that nobody else shares.
fn revert_cow(space: &mut AddressSpace, end: VirtPageNum) {
    let mut vpn = VirtPageNum(0);
    while vpn < end {
        if let Some(pte) = space.translate(vpn) {
            if pte.is_cow() && space.allocator().refcount(pte.ppn()) == 1 {
                let flags = (pte.flags() | PTEFlags::W) - PTEFlags::COW;
                space.remap_page(vpn, pte.ppn(), flags);
            }
        }
        vpn.step();
    }
}

/// Resolves a write to `va` if it hits a copy-on-write page.
///
/// With other holders the writer gets a fresh copy; as the last holder it is
/// just made writable. Either way both tables change and the TLB is flushed.
/// `OutOfMemory` leaves the mapping untouched.
pub fn resolve_write(space: &mut AddressSpace, va: VirtAddr) -> Result<CowOutcome, VmError> {
    if va.0 >= MAXVA {
        return Ok(CowOutcome::NotCow);
    }
    let vpn = va.floor();
    let pte = match space.translate(vpn) {
        Some(pte) if pte.is_cow() => pte,
        _ => return Ok(CowOutcome::NotCow),
    };
    let old = pte.ppn();
    let flags = (pte.flags() | PTEFlags::W) - PTEFlags::COW;
    let allocator = space.allocator().clone();
    let outcome = match allocator.refcount(old) {
        0 => panic!("cow: {:?} maps free frame {:?}", vpn, old),
        1 => {
            space.remap_page(vpn, old, flags);
            CowOutcome::Promoted
        }
        _ => {
            let new = allocator.alloc().ok_or(VmError::OutOfMemory)?;
            new.get_bytes_array().copy_from_slice(old.get_bytes_array());
            space.remap_page(vpn, new, flags);
            allocator.dealloc(old);
            CowOutcome::Copied
        }
    };
    space.flush_tlb();
    trace!("cow: {:?} {:?}", va, outcome);
    Ok(outcome)
}
