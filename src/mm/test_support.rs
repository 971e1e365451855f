//! Host-side scaffolding for the unit tests: page-aligned memory standing in
//! for physical RAM, an in-memory file and a tiny ELF builder.

use super::{FrameAllocator, KernelSpace, PhysAddr};
use crate::config::PAGE_SIZE;
use crate::fs::File;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// `frames` pages of zeroed, page-aligned host memory.
pub struct PhysMemory {
    ptr: *mut u8,
    layout: Layout,
}

impl PhysMemory {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }
    pub fn start(&self) -> PhysAddr {
        PhysAddr(self.ptr as usize)
    }
    pub fn end(&self) -> PhysAddr {
        PhysAddr(self.ptr as usize + self.layout.size())
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// A private allocator and kernel space over their own memory.
pub struct Machine {
    pub kernel: Arc<KernelSpace>,
    pub allocator: Arc<FrameAllocator>,
    /// frames the kernel space itself holds
    pub kernel_frames: usize,
    _memory: PhysMemory,
}

impl Machine {
    pub fn new(frames: usize) -> Self {
        let memory = PhysMemory::new(frames);
        let allocator = Arc::new(FrameAllocator::new());
        unsafe { allocator.init(memory.start(), memory.end()) };
        let kernel = Arc::new(KernelSpace::new(allocator.clone()).unwrap());
        Self {
            kernel,
            kernel_frames: allocator.used_frames(),
            allocator,
            _memory: memory,
        }
    }
}

/// A growable file kept in memory.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    writable: bool,
}

impl MemFile {
    pub fn new(data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data.to_vec()),
            writable: true,
        })
    }
    pub fn read_only(data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data.to_vec()),
            writable: false,
        })
    }
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn readable(&self) -> bool {
        true
    }
    fn writable(&self) -> bool {
        self.writable
    }
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

/// An ELF image in an 8-byte aligned buffer, as the parser requires.
pub struct ElfImage {
    words: Vec<u64>,
    len: usize,
}

impl ElfImage {
    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }
}

/// A RISC-V ELF64 executable with one `PT_LOAD` segment holding `payload`
/// at `vaddr`, `mem_size` bytes long in memory.
pub fn build_elf(vaddr: u64, payload: &[u8], mem_size: u64, entry: u64) -> ElfImage {
    const DATA_OFFSET: usize = 128;
    let len = DATA_OFFSET + payload.len();
    let mut bytes = vec![0u8; len];
    bytes[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    bytes[4] = 2; // ELFCLASS64
    bytes[5] = 1; // little endian
    bytes[6] = 1; // EV_CURRENT
    bytes[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    bytes[18..20].copy_from_slice(&0xf3u16.to_le_bytes()); // EM_RISCV
    bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
    bytes[24..32].copy_from_slice(&entry.to_le_bytes());
    bytes[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    bytes[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    bytes[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    bytes[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
    bytes[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    let ph = &mut bytes[64..120];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&7u32.to_le_bytes()); // RWX
    ph[8..16].copy_from_slice(&(DATA_OFFSET as u64).to_le_bytes());
    ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
    ph[24..32].copy_from_slice(&vaddr.to_le_bytes());
    ph[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    ph[40..48].copy_from_slice(&mem_size.to_le_bytes());
    ph[48..56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
    bytes[DATA_OFFSET..].copy_from_slice(payload);

    let mut words = vec![0u64; (len + 7) / 8];
    for (i, chunk) in bytes.chunks(8).enumerate() {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        words[i] = u64::from_le_bytes(word);
    }
    ElfImage { words, len }
}
