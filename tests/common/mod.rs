use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;
use vmcore::config::PAGE_SIZE;
use vmcore::fs::File;
use vmcore::mm::{FrameAllocator, KernelSpace, PhysAddr};

/// A frame allocator and kernel space over private host memory.
pub struct Board {
    pub kernel: Arc<KernelSpace>,
    pub frames: Arc<FrameAllocator>,
    pub baseline: usize,
    ram: *mut u8,
    layout: Layout,
}

impl Board {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ram = unsafe { alloc_zeroed(layout) };
        assert!(!ram.is_null());
        let allocator = Arc::new(FrameAllocator::new());
        unsafe {
            allocator.init(
                PhysAddr(ram as usize),
                PhysAddr(ram as usize + frames * PAGE_SIZE),
            )
        };
        let kernel = Arc::new(KernelSpace::new(allocator.clone()).unwrap());
        Board {
            kernel,
            baseline: allocator.used_frames(),
            frames: allocator,
            ram,
            layout,
        }
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        unsafe { dealloc(self.ram, self.layout) }
    }
}

pub struct SharedFile(pub Mutex<Vec<u8>>);

impl SharedFile {
    pub fn new(data: &[u8]) -> Arc<Self> {
        Arc::new(SharedFile(Mutex::new(data.to_vec())))
    }
}

impl File for SharedFile {
    fn readable(&self) -> bool {
        true
    }
    fn writable(&self) -> bool {
        true
    }
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.0.lock();
        let n = buf.len().min(data.len().saturating_sub(offset));
        if n == 0 {
            return 0;
        }
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.0.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}
