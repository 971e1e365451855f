//! Implementation of [`MemorySet`], everything a process owns of virtual
//! memory: its address space, its heap size and its mmap regions.

use super::fault::{self, AccessKind, FaultError, FaultResolution};
use super::vma::{self, Backing, Region, RegionTable, Sharing, VmProt};
use super::{AddressSpace, KernelSpace, PageTableEntry, PhysPageNum, VirtAddr, VirtPageNum};
use crate::config::{MAXUVA, MMAP_BASE, PAGE_SIZE};
use crate::error::VmError;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

bitflags! {
    /// map permission corresponding to that in pte: `R W X U`
    pub struct MapPermission: u8 {
        ///Readable
        const R = 1 << 1;
        ///Writable
        const W = 1 << 2;
        ///Excutable
        const X = 1 << 3;
        ///Accessible in U mode
        const U = 1 << 4;
    }
}

impl From<FaultError> for VmError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::OutOfMemory { .. } => VmError::OutOfMemory,
            FaultError::Protection { .. } => VmError::PermissionDenied,
            FaultError::Segfault { .. } => VmError::BadAddress,
        }
    }
}

/// memory set structure, controls virtual-memory space
pub struct MemorySet {
    space: AddressSpace,
    /// top of the heap; pages below it may still be unpopulated
    sz: usize,
    regions: RegionTable,
}

impl MemorySet {
    /// An empty process: no pages, no regions, `sz == 0`.
    pub fn new_bare(kernel: &Arc<KernelSpace>) -> Result<Self, VmError> {
        Ok(Self {
            space: AddressSpace::new(kernel)?,
            sz: 0,
            regions: RegionTable::new(),
        })
    }

    /// The first process: `image` at address 0, one page big.
    pub fn new_initial(kernel: &Arc<KernelSpace>, image: &[u8]) -> Result<Self, VmError> {
        let mut memory_set = Self::new_bare(kernel)?;
        if let Err(e) = memory_set.space.seed(image) {
            memory_set.recycle();
            return Err(e);
        }
        memory_set.sz = PAGE_SIZE;
        Ok(memory_set)
    }

    /// A process running the ELF image `elf_data`; also returns the entry point.
    pub fn from_elf(kernel: &Arc<KernelSpace>, elf_data: &[u8]) -> Result<(Self, usize), VmError> {
        let mut memory_set = Self::new_bare(kernel)?;
        match memory_set.space.load_elf(elf_data) {
            Ok((sz, entry)) => {
                memory_set.sz = sz;
                Ok((memory_set, entry))
            }
            Err(e) => {
                memory_set.recycle();
                Err(e)
            }
        }
    }

    /// satp value for user mode.
    pub fn token(&self) -> usize {
        self.space.token()
    }
    /// Heap top.
    pub fn size(&self) -> usize {
        self.sz
    }
    /// The page tables.
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }
    /// The mmap regions.
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }
    /// Valid user entry for `vpn`.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.space.translate(vpn)
    }

    /// Highest heap top allowed right now.
    fn heap_limit(&self) -> usize {
        let limit = self.regions.lowest_start().unwrap_or(MMAP_BASE);
        limit.min(MMAP_BASE).min(MAXUVA)
    }

    /// Moves the heap top by `delta` and returns the old top. Growth is lazy;
    /// shrinking releases pages at once.
    pub fn sbrk(&mut self, delta: isize) -> Result<usize, VmError> {
        let old = self.sz;
        let new = if delta >= 0 {
            old.checked_add(delta as usize)
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(VmError::InvalidArgument)?;
        self.set_size(new)?;
        Ok(old)
    }

    /// Sets the heap top to `addr` and returns 0; `brk(0)` returns the top.
    pub fn brk(&mut self, addr: usize) -> Result<usize, VmError> {
        if addr == 0 {
            return Ok(self.sz);
        }
        self.set_size(addr)?;
        Ok(0)
    }

    fn set_size(&mut self, new: usize) -> Result<(), VmError> {
        if new > self.sz {
            if new > self.heap_limit() {
                return Err(VmError::NoVirtualSpace);
            }
        } else {
            self.space.shrink(self.sz, new);
        }
        self.sz = new;
        Ok(())
    }

    /// Grows the heap to `new_sz`, populating every page now.
    pub fn grow_eager(&mut self, new_sz: usize) -> Result<usize, VmError> {
        if new_sz > self.heap_limit() {
            return Err(VmError::NoVirtualSpace);
        }
        self.sz = self.space.grow(self.sz, new_sz)?;
        Ok(self.sz)
    }

    /// A child sharing every populated page copy-on-write. Regions are
    /// inherited as descriptors and fault their pages in again.
    pub fn fork(&mut self) -> Result<Self, VmError> {
        let mut child = Self::new_bare(self.space.kernel())?;
        if let Err(e) = super::cow::fork_copy(&mut self.space, &mut child.space, self.sz) {
            child.recycle();
            return Err(e);
        }
        child.sz = self.sz;
        child.regions = self.regions.clone();
        Ok(child)
    }

    /// Creates a region of `len` bytes (rounded up to pages) below
    /// `MMAP_BASE` and above the heap, returning its start. Nothing is
    /// mapped until it is touched.
    pub fn mmap(&mut self, len: usize, prot: VmProt, sharing: Sharing, backing: Backing) -> Result<usize, VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(VmError::InvalidArgument)?
            / PAGE_SIZE
            * PAGE_SIZE;
        if let Backing::File { file, offset } = &backing {
            if offset % PAGE_SIZE != 0 {
                return Err(VmError::InvalidArgument);
            }
            if prot.contains(VmProt::READ) && !file.readable() {
                return Err(VmError::PermissionDenied);
            }
            if sharing == Sharing::Shared && prot.contains(VmProt::WRITE) && !file.writable() {
                return Err(VmError::PermissionDenied);
            }
        }
        if self.regions.is_full() {
            return Err(VmError::RegionTableFull);
        }
        let start = self.regions.place(self.sz, len).ok_or(VmError::NoVirtualSpace)?;
        self.regions.insert(Region::new(start, len, prot, sharing, backing))?;
        debug!("mmap: [{:#x}, {:#x}) {:?} {:?}", start, start + len, prot, sharing);
        Ok(start)
    }

    /// Removes the region that is exactly `[addr, addr + len)` (`len`
    /// rounded up to pages). A zero `len` is a no-op.
    pub fn munmap(&mut self, addr: usize, len: usize) -> Result<(), VmError> {
        if addr % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if len == 0 {
            return Ok(());
        }
        let len = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(VmError::InvalidArgument)?
            / PAGE_SIZE
            * PAGE_SIZE;
        let region = self.regions.remove_exact(addr, len).ok_or(VmError::NoSuchRegion)?;
        vma::unmap_region(&mut self.space, region);
        Ok(())
    }

    /// Resolves a user page fault at `va`.
    pub fn handle_page_fault(&mut self, va: usize, access: AccessKind) -> Result<FaultResolution, FaultError> {
        fault::handle_page_fault(&mut self.space, &self.regions, self.sz, va, access)
    }

    /// The frame behind user page `va`, faulting it in (or breaking COW
    /// sharing) first when needed.
    fn user_page(&mut self, va: usize, access: AccessKind) -> Result<PhysPageNum, VmError> {
        if va >= MAXUVA {
            return Err(VmError::BadAddress);
        }
        let vpn = VirtAddr(va).floor();
        let usable = |pte: &PageTableEntry| {
            pte.user()
                && match access {
                    AccessKind::Write => pte.writable(),
                    _ => pte.readable(),
                }
        };
        if let Some(pte) = self.space.translate(vpn).filter(usable) {
            return Ok(pte.ppn());
        }
        self.handle_page_fault(va, access)?;
        self.space
            .translate(vpn)
            .filter(usable)
            .map(|pte| pte.ppn())
            .ok_or(VmError::BadAddress)
    }

    fn prepare(&mut self, va: usize, len: usize, access: AccessKind) -> Result<(), VmError> {
        let end = va.checked_add(len).ok_or(VmError::BadAddress)?;
        let mut page = va - va % PAGE_SIZE;
        while page < end {
            self.user_page(page.max(va), access)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies `src` to user memory at `dst_va`, populating lazy pages and
    /// giving this process its own copy of shared ones on the way.
    pub fn copy_to_user(&mut self, dst_va: usize, src: &[u8]) -> Result<(), VmError> {
        self.prepare(dst_va, src.len(), AccessKind::Write)?;
        self.space.user_table().copy_to_user_strict(dst_va, src)
    }

    /// Fills `dst` from user memory at `src_va`, populating lazy pages.
    pub fn copy_from_user(&mut self, src_va: usize, dst: &mut [u8]) -> Result<(), VmError> {
        self.prepare(src_va, dst.len(), AccessKind::Read)?;
        self.space.user_table().copy_from_user(src_va, dst)
    }

    /// Reads a NUL-terminated user string of at most `max` bytes.
    pub fn copy_string_from_user(&mut self, src_va: usize, max: usize) -> Result<String, VmError> {
        let mut bytes = Vec::new();
        let mut va = src_va;
        while bytes.len() < max {
            let ppn = self.user_page(va, AccessKind::Read)?;
            let offset = va % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(max - bytes.len());
            let chunk = &ppn.get_bytes_array()[offset..offset + n];
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return String::from_utf8(bytes).map_err(|_| VmError::InvalidArgument);
            }
            bytes.extend_from_slice(chunk);
            va += n;
        }
        Err(VmError::InvalidArgument)
    }

    /// Releases everything: regions first (with write-back), then the heap
    /// pages and the page tables.
    pub fn recycle(self) {
        let MemorySet {
            mut space,
            sz,
            mut regions,
        } = self;
        for region in regions.take_all() {
            vma::unmap_region(&mut space, region);
        }
        space.destroy(sz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::cow::CowOutcome;
    use crate::mm::test_support::{Machine, MemFile};

    #[test]
    fn initial_process_holds_its_image() {
        let m = Machine::new(32);
        let ms = MemorySet::new_initial(&m.kernel, b"init").unwrap();
        assert_eq!(ms.size(), PAGE_SIZE);
        let page = ms.translate(VirtPageNum(0)).unwrap().ppn().get_bytes_array();
        assert_eq!(&page[..5], b"init\0");
        ms.recycle();
        assert_eq!(m.allocator.used_frames(), m.kernel_frames);
    }

    #[test]
    fn sbrk_is_lazy() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let used = m.allocator.used_frames();
        assert_eq!(ms.sbrk(3 * PAGE_SIZE as isize), Ok(PAGE_SIZE));
        assert_eq!(ms.size(), 4 * PAGE_SIZE);
        assert_eq!(m.allocator.used_frames(), used);
        ms.copy_to_user(2 * PAGE_SIZE + 10, b"abc").unwrap();
        assert_eq!(m.allocator.used_frames(), used + 1);
        let mut buf = [0u8; 3];
        ms.copy_from_user(2 * PAGE_SIZE + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(ms.sbrk(-(2 * PAGE_SIZE as isize)), Ok(4 * PAGE_SIZE));
        assert_eq!(m.allocator.used_frames(), used);
        assert_eq!(ms.sbrk(-(8 * PAGE_SIZE as isize)), Err(VmError::InvalidArgument));
        assert_eq!(ms.brk(0), Ok(2 * PAGE_SIZE));
        assert_eq!(ms.brk(5 * PAGE_SIZE), Ok(0));
        assert_eq!(ms.size(), 5 * PAGE_SIZE);
        ms.recycle();
    }

    #[test]
    fn heap_stops_below_regions() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let start = ms
            .mmap(PAGE_SIZE, VmProt::READ, Sharing::Private, Backing::Anonymous)
            .unwrap();
        assert_eq!(ms.brk(start), Ok(0));
        assert_eq!(ms.brk(start + 1), Err(VmError::NoVirtualSpace));
        assert_eq!(ms.sbrk(1), Err(VmError::NoVirtualSpace));
        assert_eq!(ms.size(), start);
        ms.recycle();
    }

    #[test]
    fn grow_eager_populates() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let used = m.allocator.used_frames();
        assert_eq!(ms.grow_eager(3 * PAGE_SIZE), Ok(3 * PAGE_SIZE));
        assert_eq!(m.allocator.used_frames(), used + 2);
        ms.recycle();
        assert_eq!(m.allocator.used_frames(), m.kernel_frames);
    }

    #[test]
    fn mmap_validates_arguments() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let anon = || Backing::Anonymous;
        assert_eq!(ms.mmap(0, VmProt::READ, Sharing::Private, anon()), Err(VmError::InvalidArgument));
        let file = MemFile::new(&[1; 16]);
        let misaligned = Backing::File { file: file.clone(), offset: 7 };
        assert_eq!(ms.mmap(16, VmProt::READ, Sharing::Private, misaligned), Err(VmError::InvalidArgument));
        let read_only = MemFile::read_only(&[1; 16]);
        let shared = Backing::File { file: read_only.clone(), offset: 0 };
        assert_eq!(
            ms.mmap(16, VmProt::READ | VmProt::WRITE, Sharing::Shared, shared),
            Err(VmError::PermissionDenied)
        );
        let private = Backing::File { file: read_only, offset: 0 };
        assert!(ms.mmap(16, VmProt::READ | VmProt::WRITE, Sharing::Private, private).is_ok());
        for _ in 1..crate::config::NVMA {
            ms.mmap(PAGE_SIZE, VmProt::READ, Sharing::Private, anon()).unwrap();
        }
        assert_eq!(ms.mmap(PAGE_SIZE, VmProt::READ, Sharing::Private, anon()), Err(VmError::RegionTableFull));
        ms.recycle();
        assert_eq!(Arc::strong_count(&file), 1);
    }

    #[test]
    fn munmap_needs_exact_region() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let start = ms
            .mmap(2 * PAGE_SIZE - 5, VmProt::READ | VmProt::WRITE, Sharing::Private, Backing::Anonymous)
            .unwrap();
        assert_eq!(start, MMAP_BASE - 2 * PAGE_SIZE);
        assert_eq!(ms.munmap(start + 1, PAGE_SIZE), Err(VmError::InvalidArgument));
        assert_eq!(ms.munmap(start, PAGE_SIZE), Err(VmError::NoSuchRegion));
        assert_eq!(ms.munmap(start, 0), Ok(()));
        ms.copy_to_user(start, b"x").unwrap();
        let used = m.allocator.used_frames();
        assert_eq!(ms.munmap(start, 2 * PAGE_SIZE - 1), Ok(()));
        assert_eq!(m.allocator.used_frames(), used - 1);
        assert!(ms.regions().is_empty());
        assert_eq!(ms.munmap(start, 2 * PAGE_SIZE), Err(VmError::NoSuchRegion));
        ms.recycle();
    }

    #[test]
    fn shared_file_region_round_trip() {
        let m = Machine::new(64);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let file = MemFile::new(b"hello, file");
        let backing = Backing::File { file: file.clone(), offset: 0 };
        let start = ms
            .mmap(PAGE_SIZE, VmProt::READ | VmProt::WRITE, Sharing::Shared, backing)
            .unwrap();
        assert_eq!(ms.copy_string_from_user(start, 64).unwrap(), "hello, file");
        ms.copy_to_user(start, b"HELLO").unwrap();
        ms.munmap(start, PAGE_SIZE).unwrap();
        let data = file.contents();
        assert_eq!(data.len(), PAGE_SIZE);
        assert_eq!(&data[..11], b"HELLO, file");
        ms.recycle();
    }

    #[test]
    fn copies_fail_on_bad_addresses() {
        let m = Machine::new(32);
        let mut ms = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ms.copy_from_user(PAGE_SIZE, &mut buf), Err(VmError::BadAddress));
        assert_eq!(ms.copy_to_user(MAXUVA, b"x"), Err(VmError::BadAddress));
        assert_eq!(ms.copy_to_user(usize::MAX - 1, b"xyz"), Err(VmError::BadAddress));
        let ro = ms
            .mmap(PAGE_SIZE, VmProt::READ, Sharing::Private, Backing::Anonymous)
            .unwrap();
        assert_eq!(ms.copy_to_user(ro, b"x"), Err(VmError::PermissionDenied));
        ms.recycle();
    }

    #[test]
    fn fork_inherits_regions_not_pages() {
        let m = Machine::new(64);
        let mut parent = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        let start = parent
            .mmap(PAGE_SIZE, VmProt::READ | VmProt::WRITE, Sharing::Private, Backing::Anonymous)
            .unwrap();
        parent.copy_to_user(start, b"parent").unwrap();
        let mut child = parent.fork().unwrap();
        assert_eq!(child.regions().len(), 1);
        assert!(child.translate(VirtAddr(start).floor()).is_none());
        let mut buf = [0xffu8; 6];
        child.copy_from_user(start, &mut buf).unwrap();
        assert_eq!(buf, [0; 6]);
        assert_eq!(
            child.handle_page_fault(0, AccessKind::Write),
            Ok(FaultResolution::CopyOnWrite(CowOutcome::Copied))
        );
        child.recycle();
        parent.recycle();
        assert_eq!(m.allocator.used_frames(), m.kernel_frames);
    }
}
