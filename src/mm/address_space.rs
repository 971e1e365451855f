//! The global kernel table and per-process user/mirror table pairs.
//!
//! Every process owns two tables that map its user range onto the same
//! frames: the user table (what `satp` points at in user mode, U set) and
//! a kernel mirror (U clear) whose upper root slots are shared with the
//! global kernel table. The mirror lets the kernel dereference user memory
//! directly while running on the process' own kernel page table.

use super::{FrameAllocator, MapPermission, PTEFlags, PageTable, PageTableEntry, PhysAddr, PhysPageNum, PteState};
use super::{StepByOne, VirtAddr, VirtPageNum};
use crate::config::{MAXUVA, MMAP_BASE, PAGE_SIZE, PAGE_SIZE_BITS, TRAMPOLINE};
use crate::error::VmError;
use alloc::sync::Arc;
use xmas_elf::program::Type;

/// Root slots below this index hold user mappings; the rest are kernel.
pub const USER_ROOT_ENTRIES: usize = MAXUVA >> (PAGE_SIZE_BITS + 9 + 9);

#[cfg(target_arch = "riscv64")]
fn local_sfence_vma() {
    unsafe { riscv::asm::sfence_vma_all() }
}

#[cfg(not(target_arch = "riscv64"))]
fn local_sfence_vma() {}

/// The global kernel table. Built once at boot, read-only afterwards.
pub struct KernelSpace {
    page_table: PageTable,
}

impl KernelSpace {
    /// A kernel table holding just the trampoline page.
    pub fn new(allocator: Arc<FrameAllocator>) -> Result<Self, VmError> {
        let mut page_table = PageTable::new(allocator.clone())?;
        let trampoline = allocator.alloc().ok_or(VmError::OutOfMemory)?;
        trampoline.get_bytes_array().fill(0);
        page_table.map_one(VirtAddr(TRAMPOLINE).floor(), trampoline, PTEFlags::R | PTEFlags::X)?;
        Ok(Self { page_table })
    }

    /// Maps `[va, va + size)` onto `[pa, pa + size)` for the kernel.
    ///
    /// Only the range above `MAXUVA` is global. Running out of memory this
    /// early is fatal.
    pub fn map_global(&mut self, va: VirtAddr, pa: PhysAddr, size: usize, perm: MapPermission) {
        assert!(va.0 >= MAXUVA, "kvmmap: {:?} is in the user range", va);
        if self.page_table.map(va, size, pa, perm.into()).is_err() {
            panic!("kvmmap: out of memory mapping {:?}", va);
        }
    }

    /// satp value of the global table.
    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    /// The underlying table.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }
}

/// A process' user table and its kernel mirror, kept in lockstep.
pub struct AddressSpace {
    user: PageTable,
    mirror: PageTable,
    kernel: Arc<KernelSpace>,
    tlb_flushes: usize,
}

/// Flags the mirror carries for a page mapped in the user table with `user`.
fn mirror_flags(user: PTEFlags) -> PTEFlags {
    user - PTEFlags::U - PTEFlags::COW
}

impl AddressSpace {
    /// Empty user table plus a mirror sharing the kernel's global slots.
    pub fn new(kernel: &Arc<KernelSpace>) -> Result<Self, VmError> {
        let allocator = kernel.page_table.allocator().clone();
        let user = PageTable::new(allocator.clone())?;
        let mirror = match PageTable::new(allocator) {
            Ok(mirror) => mirror,
            Err(e) => {
                user.free_subtree();
                return Err(e);
            }
        };
        let global = &kernel.page_table.root_ppn().get_pte_array()[USER_ROOT_ENTRIES..];
        mirror.root_ppn().get_pte_array()[USER_ROOT_ENTRIES..].copy_from_slice(global);
        Ok(Self {
            user,
            mirror,
            kernel: kernel.clone(),
            tlb_flushes: 0,
        })
    }

    /// The kernel space this mirror shares its upper half with.
    pub fn kernel(&self) -> &Arc<KernelSpace> {
        &self.kernel
    }
    /// Frame pool of both tables.
    pub fn allocator(&self) -> &Arc<FrameAllocator> {
        self.user.allocator()
    }
    /// The table user mode runs on.
    pub fn user_table(&self) -> &PageTable {
        &self.user
    }
    /// The per-process kernel table.
    pub fn mirror_table(&self) -> &PageTable {
        &self.mirror
    }
    /// satp value for user mode.
    pub fn token(&self) -> usize {
        self.user.token()
    }
    /// satp value for the process' kernel side.
    pub fn kernel_token(&self) -> usize {
        self.mirror.token()
    }
    /// Valid user entry for `vpn`.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.user.translate(vpn)
    }
    /// Decoded user entry for `vpn`.
    pub fn state(&self, vpn: VirtPageNum) -> PteState {
        self.user.state(vpn)
    }
    /// Page-table frames held by this space, excluding the shared kernel half.
    pub fn table_frames(&self) -> usize {
        self.user.table_frames(USER_ROOT_ENTRIES) + self.mirror.table_frames(USER_ROOT_ENTRIES)
    }

    /// Flushes the local TLB after a change to this space's mappings.
    pub fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
        local_sfence_vma();
    }
    /// How many flushes this space has issued.
    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes
    }

    /// Maps `vpn` in both tables; the mirror gets `flags` without U or COW.
    /// If the mirror cannot be extended the user entry is taken out again.
    pub fn map_page(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> Result<(), VmError> {
        assert!(VirtAddr::from(vpn).0 < MAXUVA, "map_page: {:?} above user range", vpn);
        self.user.map_one(vpn, ppn, flags)?;
        if let Err(e) = self.mirror.map_one(vpn, ppn, mirror_flags(flags)) {
            self.user.unmap(vpn, 1, false);
            return Err(e);
        }
        self.assert_synced(vpn);
        Ok(())
    }

    /// Rewrites an existing mapping of `vpn` in both tables.
    pub(crate) fn remap_page(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) {
        let flags = flags | PTEFlags::V;
        match (self.user.walk(vpn, false), self.mirror.walk(vpn, false)) {
            (Some(user), Some(mirror)) if user.is_valid() && mirror.is_valid() => {
                *user = PageTableEntry::new(ppn, flags);
                *mirror = PageTableEntry::new(ppn, mirror_flags(flags));
            }
            _ => panic!("remap_page: {:?} is not mapped", vpn),
        }
        self.assert_synced(vpn);
    }

    /// Unmaps `npages` pages from `vpn` in both tables. Each user leaf drops
    /// a frame reference when `free`; the mirror never does.
    pub fn unmap_pages(&mut self, vpn: VirtPageNum, npages: usize, free: bool) {
        self.mirror.unmap(vpn, npages, false);
        self.user.unmap(vpn, npages, free);
    }

    /// Debug check that user and mirror agree on `vpn`. Hardware-managed
    /// A/D bits are ignored.
    pub fn assert_synced(&self, vpn: VirtPageNum) {
        if !cfg!(debug_assertions) {
            return;
        }
        let ignore = PTEFlags::U | PTEFlags::COW | PTEFlags::A | PTEFlags::D;
        match (self.user.translate(vpn), self.mirror.translate(vpn)) {
            (None, None) => {}
            (Some(u), Some(k)) => {
                assert_eq!(u.ppn(), k.ppn(), "mirror of {:?} points elsewhere", vpn);
                assert_eq!(u.flags() - ignore, k.flags() - ignore, "mirror of {:?} has other flags", vpn);
                assert!(!k.user() && !k.is_cow(), "mirror of {:?} leaks user bits", vpn);
            }
            (u, k) => panic!("mirror of {:?} out of sync: user {:?}, mirror {:?}", vpn, u, k),
        }
    }

    /// [`assert_synced`](AddressSpace::assert_synced) over `[start, end)`.
    pub fn check_mirror(&self, start: VirtAddr, end: VirtAddr) {
        let mut vpn = start.floor();
        while vpn < end.ceil() {
            self.assert_synced(vpn);
            vpn.step();
        }
    }

    /// Installs the first process' image at address 0 in one zeroed page.
    pub fn seed(&mut self, image: &[u8]) -> Result<(), VmError> {
        assert!(image.len() < PAGE_SIZE, "seed: image does not fit in one page");
        let allocator = self.allocator().clone();
        let frame = allocator.alloc_frame().ok_or(VmError::OutOfMemory)?;
        frame.zero();
        frame.ppn.get_bytes_array()[..image.len()].copy_from_slice(image);
        self.map_page(VirtPageNum(0), frame.ppn, user_rwx())?;
        frame.leak();
        Ok(())
    }

    /// Eagerly backs `[old_sz, new_sz)` with zeroed RWX user pages. A failed
    /// allocation unmaps what this call mapped and reports `OutOfMemory`.
    pub fn grow(&mut self, old_sz: usize, new_sz: usize) -> Result<usize, VmError> {
        if new_sz < old_sz {
            return Ok(old_sz);
        }
        let start = VirtAddr(old_sz).ceil();
        let end = VirtAddr(new_sz).ceil();
        let mut vpn = start;
        while vpn < end {
            if let Err(e) = self.grow_one(vpn) {
                warn!("grow: {:?} failed at {:?}", VirtAddr(new_sz), vpn);
                self.unmap_pages(start, vpn.0 - start.0, true);
                return Err(e);
            }
            vpn.step();
        }
        Ok(new_sz)
    }

    fn grow_one(&mut self, vpn: VirtPageNum) -> Result<(), VmError> {
        let allocator = self.allocator().clone();
        let frame = allocator.alloc_frame().ok_or(VmError::OutOfMemory)?;
        frame.zero();
        self.map_page(vpn, frame.ppn, user_rwx())?;
        frame.leak();
        Ok(())
    }

    /// Releases the pages in `[new_sz, old_sz)`; missing ones are skipped.
    pub fn shrink(&mut self, old_sz: usize, new_sz: usize) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        let start = VirtAddr(new_sz).ceil();
        let end = VirtAddr(old_sz).ceil();
        if start < end {
            self.unmap_pages(start, end.0 - start.0, true);
            self.flush_tlb();
        }
        new_sz
    }

    /// Tears the space down: user pages in `[0, sz)` lose a reference, then
    /// every table node below the kernel half is freed.
    pub fn destroy(mut self, sz: usize) {
        if sz > 0 {
            self.unmap_pages(VirtPageNum(0), VirtAddr(sz).ceil().0, true);
        }
        let AddressSpace { user, mirror, .. } = self;
        user.free_subtree();
        mirror.free_user_subtrees(USER_ROOT_ENTRIES);
    }

    /// Loads the `PT_LOAD` segments of an ELF image into a fresh space and
    /// returns the resulting size and the entry point. Nothing stays mapped
    /// if loading fails.
    pub fn load_elf(&mut self, elf_data: &[u8]) -> Result<(usize, usize), VmError> {
        let mut sz = 0;
        match self.load_segments(elf_data, &mut sz) {
            Ok(entry) => Ok((sz, entry)),
            Err(e) => {
                self.shrink(sz, 0);
                Err(e)
            }
        }
    }

    fn load_segments(&mut self, elf_data: &[u8], sz: &mut usize) -> Result<usize, VmError> {
        let elf = xmas_elf::ElfFile::new(elf_data).map_err(VmError::BadElf)?;
        let elf_header = elf.header;
        let magic = elf_header.pt1.magic;
        if magic != [0x7f, 0x45, 0x4c, 0x46] {
            return Err(VmError::BadElf("invalid elf magic"));
        }
        let ph_count = elf_header.pt2.ph_count();
        for i in 0..ph_count {
            let ph = elf.program_header(i).map_err(VmError::BadElf)?;
            if ph.get_type().map_err(VmError::BadElf)? != Type::Load {
                continue;
            }
            let vaddr = ph.virtual_addr() as usize;
            let mem_size = ph.mem_size() as usize;
            let file_size = ph.file_size() as usize;
            let offset = ph.offset() as usize;
            if mem_size < file_size {
                return Err(VmError::BadElf("segment memsz < filesz"));
            }
            if vaddr % PAGE_SIZE != 0 {
                return Err(VmError::BadElf("segment not page aligned"));
            }
            let end = vaddr
                .checked_add(mem_size)
                .filter(|&end| end <= MMAP_BASE)
                .ok_or(VmError::BadElf("segment outside user range"))?;
            let data = offset
                .checked_add(file_size)
                .and_then(|file_end| elf_data.get(offset..file_end))
                .ok_or(VmError::BadElf("segment outside file"))?;
            *sz = self.grow(*sz, end)?;
            self.write_loaded(vaddr, data);
        }
        Ok(elf_header.pt2.entry_point() as usize)
    }

    /// Copies `data` to `va` through the frames just mapped by `grow`,
    /// regardless of page permissions.
    fn write_loaded(&self, va: usize, data: &[u8]) {
        let mut copied = 0;
        while copied < data.len() {
            let cur = VirtAddr(va + copied);
            let ppn = match self.user.translate(cur.floor()) {
                Some(pte) => pte.ppn(),
                None => panic!("load: {:?} not mapped", cur),
            };
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(data.len() - copied);
            ppn.get_bytes_array()[offset..offset + n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
        }
    }
}

fn user_rwx() -> PTEFlags {
    PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U
}
