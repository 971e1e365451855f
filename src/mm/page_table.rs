//! Implementation of [`PageTableEntry`] and [`PageTable`].

use super::{FrameAllocator, MapPermission, PhysAddr, PhysPageNum, StepByOne, VirtAddr, VirtPageNum};
use crate::config::{MAXVA, PAGE_SIZE, PAGE_SIZE_BITS, PTE_PER_PAGE};
use crate::error::VmError;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u16 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        /// Software bit: the page is shared read-only and a write fault must
        /// give the writer its own copy.
        const COW = 1 << 8;
    }
}

impl From<MapPermission> for PTEFlags {
    fn from(perm: MapPermission) -> Self {
        PTEFlags::from_bits_truncate(perm.bits() as u16)
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    /// raw Sv39 entry
    pub bits: usize,
}

impl PageTableEntry {
    /// Entry pointing at `ppn` with `flags`.
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    /// An invalid entry.
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    /// Page number the entry points at.
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    /// Flag bits, including the software bits.
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate((self.bits & 0x3ff) as u16)
    }
    /// V
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    /// A valid entry with any of R/W/X maps a page; otherwise it points at
    /// the next-level table.
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }
    /// R
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    /// W
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    /// X
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
    /// U
    pub fn user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
    /// Write faults on this page are resolved by copy-on-write.
    pub fn is_cow(&self) -> bool {
        self.flags().contains(PTEFlags::COW)
    }
    /// Decoded view of the entry.
    pub fn state(&self) -> PteState {
        if !self.is_valid() {
            PteState::Absent
        } else if !self.is_leaf() {
            PteState::NonLeaf(self.ppn())
        } else {
            PteState::Leaf {
                ppn: self.ppn(),
                perm: MapPermission::from_bits_truncate(self.flags().bits() as u8),
                cow_pending: self.is_cow(),
            }
        }
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:?}, {:?})", self.ppn(), self.flags())
    }
}

/// What an entry means, without the bit fiddling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    /// Nothing mapped.
    Absent,
    /// Points at the next-level table.
    NonLeaf(PhysPageNum),
    /// Maps a page.
    Leaf {
        /// the page
        ppn: PhysPageNum,
        /// R/W/X/U as currently installed
        perm: MapPermission,
        /// a write fault must copy or promote the page
        cow_pending: bool,
    },
}

/// A three-level Sv39 page table whose nodes come from `allocator`.
///
/// The table owns its node frames but not the leaves: whoever maps a page
/// decides whether unmapping drops its reference.
pub struct PageTable {
    root_ppn: PhysPageNum,
    allocator: Arc<FrameAllocator>,
}

impl PageTable {
    /// A table with only a zeroed root.
    pub fn new(allocator: Arc<FrameAllocator>) -> Result<Self, VmError> {
        let root_ppn = allocator.alloc().ok_or(VmError::OutOfMemory)?;
        root_ppn.get_bytes_array().fill(0);
        Ok(PageTable {
            root_ppn,
            allocator,
        })
    }
    /// Root node.
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }
    /// Where node frames come from.
    pub fn allocator(&self) -> &Arc<FrameAllocator> {
        &self.allocator
    }
    /// satp value selecting this table in Sv39 mode.
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    /// The level-0 entry for `vpn`. With `create`, missing intermediate nodes
    /// are allocated zeroed; `None` means one was missing (or could not be
    /// allocated).
    ///
    /// Panics on addresses at or above `MAXVA`.
    pub fn walk(&self, vpn: VirtPageNum, create: bool) -> Option<&mut PageTableEntry> {
        if vpn.0 >= MAXVA >> PAGE_SIZE_BITS {
            panic!("walk: {:?} out of range", VirtAddr::from(vpn));
        }
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for &idx in &idxs[..2] {
            let pte = &mut ppn.get_pte_array()[idx];
            if !pte.is_valid() {
                if !create {
                    return None;
                }
                let frame = self.allocator.alloc()?;
                frame.get_bytes_array().fill(0);
                *pte = PageTableEntry::new(frame, PTEFlags::V);
            }
            ppn = pte.ppn();
        }
        Some(&mut ppn.get_pte_array()[idxs[2]])
    }

    /// Maps one page. Panics if `vpn` is already mapped.
    pub fn map_one(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> Result<(), VmError> {
        let pte = self.walk(vpn, true).ok_or(VmError::OutOfMemory)?;
        assert!(!pte.is_valid(), "remap {:?} -> {:?}", vpn, pte);
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }

    /// Maps the pages covering `[va, va + size)` onto consecutive frames from
    /// `pa`. On failure the pages installed by this call are removed again.
    pub fn map(&mut self, va: VirtAddr, size: usize, pa: PhysAddr, flags: PTEFlags) -> Result<(), VmError> {
        assert!(size > 0, "map: empty range at {:?}", va);
        let first = va.floor();
        let last = VirtAddr(va.0 + size - 1).floor();
        let mut vpn = first;
        let mut ppn = pa.floor();
        loop {
            if let Err(e) = self.map_one(vpn, ppn, flags) {
                self.unmap(first, vpn.0 - first.0, false);
                return Err(e);
            }
            if vpn == last {
                return Ok(());
            }
            vpn.step();
            ppn.step();
        }
    }

    /// Clears `npages` entries from `vpn`, dropping a frame reference for each
    /// when `free`. Pages that are not mapped are skipped.
    pub fn unmap(&mut self, vpn: VirtPageNum, npages: usize, free: bool) {
        for i in 0..npages {
            let vpn = VirtPageNum(vpn.0 + i);
            if let Some(pte) = self.walk(vpn, false) {
                if !pte.is_valid() {
                    continue;
                }
                if !pte.is_leaf() {
                    panic!("unmap: {:?} is not a leaf", vpn);
                }
                let ppn = pte.ppn();
                *pte = PageTableEntry::empty();
                if free {
                    self.allocator.dealloc(ppn);
                }
            }
        }
    }

    /// The valid entry for `vpn`, if any.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.walk(vpn, false).map(|pte| *pte).filter(|pte| pte.is_valid())
    }

    /// Decoded entry for `vpn`.
    pub fn state(&self, vpn: VirtPageNum) -> PteState {
        match self.walk(vpn, false) {
            Some(pte) => pte.state(),
            None => PteState::Absent,
        }
    }

    /// Physical address behind a user-accessible `va`. Unlike [`walk`], an
    /// out-of-range address is just untranslatable.
    ///
    /// [`walk`]: PageTable::walk
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.0 >= MAXVA {
            return None;
        }
        self.translate(va.floor())
            .filter(|pte| pte.user())
            .map(|pte| PhysAddr(PhysAddr::from(pte.ppn()).0 + va.page_offset()))
    }

    /// Physical pages behind a user buffer, split at page boundaries.
    fn user_chunks(&self, va: usize, len: usize, writable: bool) -> Result<Vec<&'static mut [u8]>, VmError> {
        let mut chunks = Vec::new();
        let mut start = va;
        let end = va.checked_add(len).ok_or(VmError::BadAddress)?;
        while start < end {
            let page_end = (start / PAGE_SIZE + 1) * PAGE_SIZE;
            let n = page_end.min(end) - start;
            let pa = self.translate_va(VirtAddr(start)).ok_or(VmError::BadAddress)?;
            if writable && !self.translate(VirtAddr(start).floor()).map_or(false, |pte| pte.writable()) {
                return Err(VmError::PermissionDenied);
            }
            let offset = pa.page_offset();
            chunks.push(&mut pa.floor().get_bytes_array()[offset..offset + n]);
            start += n;
        }
        Ok(chunks)
    }

    /// Copies `dst.len()` bytes from user address `src_va`.
    pub fn copy_from_user(&self, src_va: usize, dst: &mut [u8]) -> Result<(), VmError> {
        let mut copied = 0;
        for chunk in self.user_chunks(src_va, dst.len(), false)? {
            dst[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
        }
        Ok(())
    }

    /// Copies `src` to user address `dst_va`. Every destination page must be
    /// mapped writable; nothing is written otherwise.
    pub fn copy_to_user_strict(&self, dst_va: usize, src: &[u8]) -> Result<(), VmError> {
        let mut copied = 0;
        for chunk in self.user_chunks(dst_va, src.len(), true)? {
            let n = chunk.len();
            chunk.copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `max` bytes (terminator
    /// included) from user address `src_va`.
    pub fn copy_string_from_user(&self, src_va: usize, max: usize) -> Result<String, VmError> {
        let mut bytes = Vec::new();
        let mut va = src_va;
        while bytes.len() < max {
            let pa = self.translate_va(VirtAddr(va)).ok_or(VmError::BadAddress)?;
            let offset = pa.page_offset();
            let n = (PAGE_SIZE - offset).min(max - bytes.len());
            let page = &pa.floor().get_bytes_array()[offset..offset + n];
            if let Some(nul) = page.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&page[..nul]);
                return String::from_utf8(bytes).map_err(|_| VmError::InvalidArgument);
            }
            bytes.extend_from_slice(page);
            va += n;
        }
        Err(VmError::InvalidArgument)
    }

    /// Number of node frames reachable through the first `root_entries`
    /// root slots, counting the root itself.
    pub fn table_frames(&self, root_entries: usize) -> usize {
        fn count(table: PhysPageNum, entries: usize) -> usize {
            1 + table.get_pte_array()[..entries]
                .iter()
                .filter(|pte| pte.is_valid() && !pte.is_leaf())
                .map(|pte| count(pte.ppn(), PTE_PER_PAGE))
                .sum::<usize>()
        }
        count(self.root_ppn, root_entries)
    }

    fn free_walk(&self, table: PhysPageNum) {
        for pte in table.get_pte_array().iter_mut() {
            if pte.is_leaf() {
                panic!("freewalk: leaf {:?} still mapped", pte);
            }
            if pte.is_valid() {
                self.free_walk(pte.ppn());
                *pte = PageTableEntry::empty();
            }
        }
        self.allocator.dealloc(table);
    }

    /// Frees every node of the table. All leaves must already be unmapped.
    pub fn free_subtree(self) {
        self.free_walk(self.root_ppn);
    }

    /// Frees the subtrees hanging off root slots `[0, split)` and then the
    /// root, leaving the shared subtrees above `split` alone.
    pub fn free_user_subtrees(self, split: usize) {
        for pte in self.root_ppn.get_pte_array()[..split].iter_mut() {
            if pte.is_leaf() {
                panic!("freewalk: leaf {:?} still mapped", pte);
            }
            if pte.is_valid() {
                self.free_walk(pte.ppn());
                *pte = PageTableEntry::empty();
            }
        }
        self.allocator.dealloc(self.root_ppn);
    }
}
