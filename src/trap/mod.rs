//! Routing of user-mode exceptions into the memory system.
//!
//! The trap entry itself (saving registers, switching `satp`) belongs to the
//! platform; it hands the raw `scause`/`stval` pair to
//! [`handle_user_exception`].

use crate::mm::AccessKind;
use crate::task::TaskControlBlock;

const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

/// Synchronous exceptions the VM core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// scause 12
    InstructionPageFault,
    /// scause 13
    LoadPageFault,
    /// scause 15
    StorePageFault,
    /// Anything else, with the raw cause.
    Other(usize),
}

impl Exception {
    /// Decodes `scause`. Interrupts are never page faults.
    pub fn from_scause(scause: usize) -> Self {
        if scause & INTERRUPT_BIT != 0 {
            return Exception::Other(scause);
        }
        match scause {
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            code => Exception::Other(code),
        }
    }

    /// The access a page fault stands for.
    pub fn access(&self) -> Option<AccessKind> {
        match self {
            Exception::InstructionPageFault => Some(AccessKind::Execute),
            Exception::LoadPageFault => Some(AccessKind::Read),
            Exception::StorePageFault => Some(AccessKind::Write),
            Exception::Other(_) => None,
        }
    }
}

/// Handles an exception taken from user mode. Returns whether `task` may
/// resume; otherwise it has been marked killed.
pub fn handle_user_exception(task: &TaskControlBlock, scause: usize, stval: usize) -> bool {
    let exception = Exception::from_scause(scause);
    match exception.access() {
        Some(access) => task.page_fault(stval, access),
        None => {
            error!(
                "pid {}: unexpected {:?}, stval = {:#x}, killed",
                task.getpid(),
                exception,
                stval
            );
            task.kill();
            false
        }
    }
}
