//! Memory-mapped regions and the per-process table that tracks them.

use super::{AddressSpace, PTEFlags, VirtAddr};
use crate::config::{MMAP_BASE, NVMA, PAGE_SIZE};
use crate::error::VmError;
use crate::fs::File;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};

bitflags! {
    /// `prot` argument of `mmap`.
    pub struct VmProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// `flags` argument of `mmap`.
    pub struct MapFlags: u32 {
        const PRIVATE = 1 << 0;
        const ANONYMOUS = 1 << 1;
        const SHARED = 1 << 2;
        const FIXED = 1 << 3;
    }
}

/// Whether stores reach the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Changes stay in the process.
    Private,
    /// Changes are written back to the file on unmap.
    Shared,
}

/// Where a region's contents come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled memory.
    Anonymous,
    /// A window of an open file starting at a page-aligned `offset`.
    File {
        /// the file, kept open while the region exists
        file: Arc<dyn File>,
        /// file offset of the region's first byte
        offset: usize,
    },
}

impl Debug for Backing {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Anonymous => write!(f, "Anonymous"),
            Backing::File { offset, .. } => write!(f, "File@{:#x}", offset),
        }
    }
}

/// A page-aligned range `[start, end)` whose pages are populated on first
/// touch.
#[derive(Debug, Clone)]
pub struct Region {
    /// first byte
    pub start: usize,
    /// one past the last byte
    pub end: usize,
    /// what user code may do
    pub prot: VmProt,
    /// private or shared
    pub sharing: Sharing,
    /// where the contents come from
    pub backing: Backing,
}

impl Region {
    /// A region of `len` bytes at `start`; both must be page aligned.
    pub fn new(start: usize, len: usize, prot: VmProt, sharing: Sharing, backing: Backing) -> Self {
        assert!(start % PAGE_SIZE == 0 && len % PAGE_SIZE == 0 && len > 0);
        Self {
            start,
            end: start + len,
            prot,
            sharing,
            backing,
        }
    }
    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }
    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.len() / PAGE_SIZE
    }
    /// `va` falls inside the region.
    pub fn contains(&self, va: usize) -> bool {
        self.start <= va && va < self.end
    }
    /// Shares at least one byte with `[start, end)`.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
    /// Leaf flags for pages of this region. Writable implies readable.
    pub fn page_flags(&self) -> PTEFlags {
        let mut flags = PTEFlags::U;
        if self.prot.intersects(VmProt::READ | VmProt::WRITE) {
            flags |= PTEFlags::R;
        }
        if self.prot.contains(VmProt::WRITE) {
            flags |= PTEFlags::W;
        }
        if self.prot.contains(VmProt::EXEC) {
            flags |= PTEFlags::X;
        }
        flags
    }
    /// Byte offset in the backing file that page-aligned `va` maps to.
    pub fn file_offset(&self, va: usize) -> Option<(&Arc<dyn File>, usize)> {
        match &self.backing {
            Backing::File { file, offset } => Some((file, offset + (va - self.start))),
            Backing::Anonymous => None,
        }
    }
    /// Shared, writable and file-backed: dirty pages must reach the file.
    pub fn needs_writeback(&self) -> bool {
        self.sharing == Sharing::Shared
            && self.prot.contains(VmProt::WRITE)
            && matches!(self.backing, Backing::File { .. })
    }
}

/// At most [`NVMA`] regions per process, pairwise disjoint.
#[derive(Clone)]
pub struct RegionTable {
    slots: [Option<Region>; NVMA],
}

impl RegionTable {
    /// No regions.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }
    /// Live regions, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.slots.iter().flatten()
    }
    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.iter().count()
    }
    /// No region is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Every slot is taken.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
    /// Region containing `va`.
    pub fn find(&self, va: usize) -> Option<&Region> {
        self.iter().find(|r| r.contains(va))
    }
    /// Lowest start address of any region.
    pub fn lowest_start(&self) -> Option<usize> {
        self.iter().map(|r| r.start).min()
    }

    /// Picks a start for `len` bytes (page aligned), searching down from
    /// `MMAP_BASE` and never reaching below the heap top `sz`.
    pub fn place(&self, sz: usize, len: usize) -> Option<usize> {
        let mut top = MMAP_BASE;
        loop {
            let start = top.checked_sub(len)?;
            if start < sz {
                return None;
            }
            match self.iter().filter(|r| r.overlaps(start, top)).map(|r| r.start).min() {
                Some(conflict) => top = conflict,
                None => return Some(start),
            }
        }
    }

    /// Records `region` in a free slot.
    pub fn insert(&mut self, region: Region) -> Result<(), VmError> {
        if self.iter().any(|r| r.overlaps(region.start, region.end)) {
            return Err(VmError::Overlap);
        }
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(region);
                Ok(())
            }
            None => Err(VmError::RegionTableFull),
        }
    }

    /// Takes out the region that is exactly `[start, start + len)`.
    pub fn remove_exact(&mut self, start: usize, len: usize) -> Option<Region> {
        self.slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(r) if r.start == start && r.len() == len))
            .and_then(Option::take)
    }

    /// Empties the table.
    pub fn take_all(&mut self) -> Vec<Region> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Unmaps every page of `region` from both tables, writing shared dirty
/// pages back first. Private pages drop their frame reference; shared ones
/// are left alone. Dropping the region closes its file.
pub fn unmap_region(space: &mut AddressSpace, region: Region) {
    if region.needs_writeback() {
        write_back(space, &region);
    }
    let free = region.sharing == Sharing::Private;
    space.unmap_pages(VirtAddr(region.start).floor(), region.page_count(), free);
    space.flush_tlb();
    debug!("munmap: [{:#x}, {:#x}) {:?}", region.start, region.end, region.backing);
}

/// Writes every populated page of `region` back as a whole page.
fn write_back(space: &AddressSpace, region: &Region) {
    for va in (region.start..region.end).step_by(PAGE_SIZE) {
        let pte = match space.translate(VirtAddr(va).floor()) {
            Some(pte) => pte,
            None => continue,
        };
        if let Some((file, offset)) = region.file_offset(va) {
            file.write_at(offset, pte.ppn().get_bytes_array());
        }
    }
}
