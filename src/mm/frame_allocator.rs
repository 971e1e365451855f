//! Implementation of [`FrameAllocator`], the reference-counted pool of
//! physical page frames every page table and user page is carved from.

use super::{PhysAddr, PhysPageNum};
use crate::config::{ALLOC_JUNK, FREE_JUNK, PAGE_SIZE};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};
use spin::Mutex;

/// Last-chance hook run when the pool is empty.
///
/// Called at most once per failed allocation, without the allocator lock
/// held, so an implementation may free frames back into `allocator`.
pub trait FrameReclaimer: Send + Sync {
    /// Tries to return frames to the pool; `true` if anything was freed.
    fn reclaim(&self, allocator: &FrameAllocator) -> bool;
}

struct FrameAllocatorInner {
    /// first managed page number
    base: usize,
    /// next never-used page number
    current: usize,
    end: usize,
    recycled: Vec<usize>,
    /// one counter per managed frame, indexed by `ppn - base`
    refcount: Vec<u32>,
}

impl FrameAllocatorInner {
    fn index(&self, ppn: PhysPageNum) -> usize {
        if ppn.0 < self.base || ppn.0 >= self.end {
            panic!("frame {:?} is not managed by this allocator", ppn);
        }
        ppn.0 - self.base
    }
    fn free_frames(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

/// A stack allocator over a contiguous range of physical frames, with one
/// reference count per frame.
///
/// A frame is on the free list exactly when its count is zero. New frames are
/// filled with [`ALLOC_JUNK`] and freed ones with [`FREE_JUNK`] so reads of
/// uninitialized or stale memory stand out.
pub struct FrameAllocator {
    inner: Mutex<FrameAllocatorInner>,
    reclaimer: Mutex<Option<Arc<dyn FrameReclaimer>>>,
}

impl FrameAllocator {
    /// An allocator that manages no frames yet.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FrameAllocatorInner {
                base: 0,
                current: 0,
                end: 0,
                recycled: Vec::new(),
                refcount: Vec::new(),
            }),
            reclaimer: Mutex::new(None),
        }
    }

    /// Hands the frames in `[start, end)` to the allocator, rounding inward to
    /// page boundaries.
    ///
    /// # Safety
    ///
    /// The range must be memory nothing else uses, readable and writable
    /// through its physical address for as long as the allocator lives.
    pub unsafe fn init(&self, start: PhysAddr, end: PhysAddr) {
        let (l, r) = (start.ceil().0, end.floor().0);
        assert!(l <= r, "frame allocator: empty range {:?}..{:?}", start, end);
        let mut inner = self.inner.lock();
        assert!(inner.end == inner.base, "frame allocator initialized twice");
        inner.base = l;
        inner.current = l;
        inner.end = r;
        inner.refcount = vec![0; r - l];
        info!("frame allocator: {} frames at {:?}", r - l, start);
    }

    /// Installs the hook consulted when the pool runs dry.
    pub fn set_reclaimer(&self, reclaimer: Arc<dyn FrameReclaimer>) {
        *self.reclaimer.lock() = Some(reclaimer);
    }

    /// Takes a frame with reference count 1, or `None` if physical memory is
    /// exhausted even after asking the reclaimer.
    pub fn alloc(&self) -> Option<PhysPageNum> {
        let ppn = match self.pop() {
            Some(ppn) => Some(ppn),
            None => {
                let reclaimer = self.reclaimer.lock().clone();
                match reclaimer {
                    Some(reclaimer) if reclaimer.reclaim(self) => self.pop(),
                    _ => None,
                }
            }
        };
        match ppn {
            Some(ppn) => {
                ppn.get_bytes_array().fill(ALLOC_JUNK);
                Some(ppn)
            }
            None => {
                warn!("frame allocator: out of physical memory");
                None
            }
        }
    }

    fn pop(&self) -> Option<PhysPageNum> {
        let mut inner = self.inner.lock();
        let ppn = if let Some(ppn) = inner.recycled.pop() {
            ppn
        } else if inner.current < inner.end {
            inner.current += 1;
            inner.current - 1
        } else {
            return None;
        };
        let idx = ppn - inner.base;
        inner.refcount[idx] = 1;
        Some(ppn.into())
    }

    /// Drops one reference; the frame goes back to the pool when none remain.
    ///
    /// Panics if the frame is already free or outside the managed range.
    pub fn dealloc(&self, ppn: PhysPageNum) {
        let last = {
            let mut inner = self.inner.lock();
            let idx = inner.index(ppn);
            match inner.refcount[idx] {
                0 => panic!("frame {:?} freed while not in use", ppn),
                count => {
                    inner.refcount[idx] = count - 1;
                    count == 1
                }
            }
        };
        // nobody can hand the frame out before it is on the free list
        if last {
            ppn.get_bytes_array().fill(FREE_JUNK);
            self.inner.lock().recycled.push(ppn.0);
        }
    }

    /// Adds one reference to an allocated frame.
    pub fn incref(&self, ppn: PhysPageNum) {
        let mut inner = self.inner.lock();
        let idx = inner.index(ppn);
        assert!(inner.refcount[idx] > 0, "incref on free frame {:?}", ppn);
        inner.refcount[idx] += 1;
    }

    /// Current reference count of `ppn`; zero means free.
    pub fn refcount(&self, ppn: PhysPageNum) -> usize {
        let inner = self.inner.lock();
        let idx = inner.index(ppn);
        inner.refcount[idx] as usize
    }

    /// Whether `ppn` lies in the managed range.
    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        let inner = self.inner.lock();
        ppn.0 >= inner.base && ppn.0 < inner.end
    }

    /// Frames currently handed out.
    pub fn used_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.end - inner.base - inner.free_frames()
    }

    /// Bytes still available for allocation.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free_frames() * PAGE_SIZE
    }

    /// Size of the managed range in frames.
    pub fn total_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.end - inner.base
    }

    /// Allocates a frame owned by the returned guard.
    pub fn alloc_frame(&self) -> Option<FrameTracker<'_>> {
        self.alloc().map(|ppn| FrameTracker {
            ppn,
            allocator: self,
        })
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame that goes back to its allocator when dropped, unless it was
/// [`leak`](FrameTracker::leak)ed into a page table first.
pub struct FrameTracker<'a> {
    /// physical page number
    pub ppn: PhysPageNum,
    allocator: &'a FrameAllocator,
}

impl FrameTracker<'_> {
    /// Fills the frame with zeroes.
    pub fn zero(&self) {
        self.ppn.get_bytes_array().fill(0);
    }
    /// Gives up ownership; the reference now belongs to whoever maps the frame.
    pub fn leak(self) -> PhysPageNum {
        let ppn = self.ppn;
        core::mem::forget(self);
        ppn
    }
}

impl Debug for FrameTracker<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker<'_> {
    fn drop(&mut self) {
        self.allocator.dealloc(self.ppn);
    }
}
