//! Implementation of syscalls
//!
//! The single entry point to all system calls, [`syscall()`], is called
//! whenever userspace wishes to perform a system call using the `ecall`
//! instruction. Only the memory-management calls are served here; each
//! failure is reported to user space as `-1`.

const SYSCALL_FORK: usize = 1;
const SYSCALL_SBRK: usize = 12;
const SYSCALL_BRK: usize = 214;
const SYSCALL_MUNMAP: usize = 215;
const SYSCALL_MMAP: usize = 222;
const SYSCALL_GETPROCSZ: usize = 500;
const SYSCALL_GETPGCNT: usize = 501;

mod process;

use crate::task::TaskControlBlock;
use alloc::sync::Arc;
use process::*;

/// handle syscall exception with `syscall_id` and other arguments
pub fn syscall(task: &Arc<TaskControlBlock>, syscall_id: usize, args: [usize; 6]) -> isize {
    match syscall_id {
        SYSCALL_FORK => sys_fork(task),
        SYSCALL_SBRK => sys_sbrk(task, args[0] as isize),
        SYSCALL_BRK => sys_brk(task, args[0]),
        SYSCALL_MUNMAP => sys_munmap(task, args[0], args[1]),
        SYSCALL_MMAP => sys_mmap(task, args[0], args[1], args[2], args[3], args[4], args[5]),
        SYSCALL_GETPROCSZ => sys_getprocsz(task),
        SYSCALL_GETPGCNT => sys_getpgcnt(task),
        _ => {
            warn!("unsupported syscall_id: {}", syscall_id);
            -1
        }
    }
}
