//! Types related to task management

use super::{pid_alloc, PidHandle};
use crate::error::VmError;
use crate::fs::File;
use crate::mm::{AccessKind, KernelSpace, MemorySet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// task control block structure
pub struct TaskControlBlock {
    /// immutable
    pub pid: PidHandle,
    inner: Mutex<TaskControlBlockInner>,
}

/// The mutable part of a task, behind its lock.
pub struct TaskControlBlockInner {
    pub task_status: TaskStatus,
    /// `None` once the task has exited
    pub memory_set: Option<MemorySet>,
    pub fd_table: Vec<Option<Arc<dyn File>>>,
    pub children: Vec<Arc<TaskControlBlock>>,
    /// set when the task must die at its next return to user mode
    pub killed: bool,
    pub exit_code: i32,
}

impl TaskControlBlockInner {
    /// The open file behind `fd`.
    pub fn file(&self, fd: usize) -> Option<Arc<dyn File>> {
        self.fd_table.get(fd).and_then(|f| f.clone())
    }
    /// Lowest free descriptor, growing the table if needed.
    pub fn alloc_fd(&mut self) -> usize {
        if let Some(fd) = (0..self.fd_table.len()).find(|fd| self.fd_table[*fd].is_none()) {
            fd
        } else {
            self.fd_table.push(None);
            self.fd_table.len() - 1
        }
    }
}

impl TaskControlBlock {
    fn with_memory_set(memory_set: MemorySet, fd_table: Vec<Option<Arc<dyn File>>>) -> Arc<Self> {
        Arc::new(Self {
            pid: pid_alloc(),
            inner: Mutex::new(TaskControlBlockInner {
                task_status: TaskStatus::Ready,
                memory_set: Some(memory_set),
                fd_table,
                children: Vec::new(),
                killed: false,
                exit_code: 0,
            }),
        })
    }

    /// The first user process, running `image` from address 0.
    pub fn new_initial(kernel: &Arc<KernelSpace>, image: &[u8]) -> Result<Arc<Self>, VmError> {
        let memory_set = MemorySet::new_initial(kernel, image)?;
        Ok(Self::with_memory_set(memory_set, Vec::new()))
    }

    /// A process running an ELF executable; also returns its entry point.
    pub fn from_elf(kernel: &Arc<KernelSpace>, elf_data: &[u8]) -> Result<(Arc<Self>, usize), VmError> {
        let (memory_set, entry) = MemorySet::from_elf(kernel, elf_data)?;
        Ok((Self::with_memory_set(memory_set, Vec::new()), entry))
    }

    /// Get the mutable reference of the inner TCB
    pub fn inner_exclusive_access(&self) -> MutexGuard<'_, TaskControlBlockInner> {
        self.inner.lock()
    }

    /// Get the pid of the task
    pub fn getpid(&self) -> usize {
        self.pid.0
    }

    /// Installs `file` in the lowest free descriptor.
    pub fn add_file(&self, file: Arc<dyn File>) -> usize {
        let mut inner = self.inner_exclusive_access();
        let fd = inner.alloc_fd();
        inner.fd_table[fd] = Some(file);
        fd
    }

    /// A child sharing this task's memory copy-on-write and its open files.
    pub fn fork(self: &Arc<Self>) -> Result<Arc<Self>, VmError> {
        let mut parent_inner = self.inner_exclusive_access();
        let memory_set = match parent_inner.memory_set.as_mut() {
            Some(memory_set) => memory_set.fork()?,
            None => return Err(VmError::InvalidArgument),
        };
        let child = Self::with_memory_set(memory_set, parent_inner.fd_table.clone());
        parent_inner.children.push(child.clone());
        debug!("fork: pid {} -> pid {}", self.getpid(), child.getpid());
        Ok(child)
    }

    /// Releases the task's memory and files; it stays around as a zombie.
    pub fn exit(&self, exit_code: i32) {
        let mut inner = self.inner_exclusive_access();
        inner.task_status = TaskStatus::Zombie;
        inner.exit_code = exit_code;
        if let Some(memory_set) = inner.memory_set.take() {
            memory_set.recycle();
        }
        inner.fd_table.clear();
        info!("pid {} exited with code {}", self.getpid(), exit_code);
    }

    /// Marks the task for termination.
    pub fn kill(&self) {
        self.inner_exclusive_access().killed = true;
    }

    /// Whether the task has been marked for termination.
    pub fn is_killed(&self) -> bool {
        self.inner_exclusive_access().killed
    }

    /// Runs the fault dispatcher for this task. An unresolved fault kills
    /// the task; the return value says whether it may go back to user mode.
    pub fn page_fault(&self, va: usize, access: AccessKind) -> bool {
        let mut inner = self.inner_exclusive_access();
        let result = match inner.memory_set.as_mut() {
            Some(memory_set) => memory_set.handle_page_fault(va, access),
            None => return false,
        };
        match result {
            Ok(resolution) => {
                trace!("pid {}: {:#x} resolved as {:?}", self.getpid(), va, resolution);
                !inner.killed
            }
            Err(e) => {
                error!("pid {}: page fault: {}, killed", self.getpid(), e);
                inner.killed = true;
                false
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// task status: Ready, Running, Zombie
pub enum TaskStatus {
    Ready,
    Running,
    Zombie,
}
