//! Process memory syscalls

use crate::error::VmError;
use crate::mm::vma::{Backing, MapFlags, Sharing, VmProt};
use crate::mm::MemorySet;
use crate::task::TaskControlBlock;
use alloc::sync::Arc;
use core::convert::TryFrom;

/// Runs `f` on the task's memory set and folds errors into `-1`.
fn with_memory_set<F>(task: &TaskControlBlock, name: &str, f: F) -> isize
where
    F: FnOnce(&mut MemorySet) -> Result<usize, VmError>,
{
    let mut inner = task.inner_exclusive_access();
    let result = match inner.memory_set.as_mut() {
        Some(memory_set) => f(memory_set),
        None => Err(VmError::InvalidArgument),
    };
    match result {
        Ok(value) => value as isize,
        Err(e) => {
            debug!("pid {}: {} failed: {}", task.getpid(), name, e);
            -1
        }
    }
}

/// Duplicates the calling process; returns the child's pid.
pub fn sys_fork(task: &Arc<TaskControlBlock>) -> isize {
    match task.fork() {
        Ok(child) => child.getpid() as isize,
        Err(e) => {
            warn!("pid {}: fork failed: {}", task.getpid(), e);
            -1
        }
    }
}

/// Moves the heap top by `increment`, returning the previous top.
pub fn sys_sbrk(task: &TaskControlBlock, increment: isize) -> isize {
    with_memory_set(task, "sbrk", |ms| ms.sbrk(increment))
}

/// Sets the heap top, returning 0; `brk(0)` reports it.
pub fn sys_brk(task: &TaskControlBlock, addr: usize) -> isize {
    with_memory_set(task, "brk", |ms| ms.brk(addr))
}

/// Maps `len` bytes of anonymous memory or of file `fd` at `offset`.
/// The kernel always picks the address.
pub fn sys_mmap(
    task: &TaskControlBlock,
    addr: usize,
    len: usize,
    prot: usize,
    flags: usize,
    fd: usize,
    offset: usize,
) -> isize {
    let prot = u32::try_from(prot).ok().and_then(VmProt::from_bits);
    let flags = u32::try_from(flags).ok().and_then(MapFlags::from_bits);
    let (prot, flags) = match (prot, flags) {
        (Some(prot), Some(flags)) => (prot, flags),
        _ => return -1,
    };
    if len == 0 || addr != 0 || flags.contains(MapFlags::FIXED) {
        return -1;
    }
    let sharing = if flags.contains(MapFlags::SHARED) {
        Sharing::Shared
    } else {
        Sharing::Private
    };
    let backing = if flags.contains(MapFlags::ANONYMOUS) {
        Backing::Anonymous
    } else {
        match task.inner_exclusive_access().file(fd) {
            Some(file) => Backing::File { file, offset },
            None => return -1,
        }
    };
    with_memory_set(task, "mmap", |ms| ms.mmap(len, prot, sharing, backing))
}

/// Removes the region mapped exactly at `[addr, addr + len)`.
pub fn sys_munmap(task: &TaskControlBlock, addr: usize, len: usize) -> isize {
    with_memory_set(task, "munmap", |ms| ms.munmap(addr, len).map(|_| 0))
}

/// Size of the calling process' heap.
pub fn sys_getprocsz(task: &TaskControlBlock) -> isize {
    with_memory_set(task, "getprocsz", |ms| Ok(ms.size()))
}

/// Number of physical frames in use system-wide.
pub fn sys_getpgcnt(task: &TaskControlBlock) -> isize {
    with_memory_set(task, "getpgcnt", |ms| {
        Ok(ms.address_space().allocator().used_frames())
    })
}
