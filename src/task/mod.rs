//! Process control blocks, reduced to what the memory system needs: a pid,
//! a memory set, open files and a killed flag. Scheduling lives elsewhere.

mod pid;
#[allow(clippy::module_inception)]
mod task;

pub use pid::{pid_alloc, PidHandle};
pub use task::{TaskControlBlock, TaskControlBlockInner, TaskStatus};
