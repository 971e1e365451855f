//! The virtual-memory core of a small RISC-V teaching kernel.
//!
//! Every process owns a pair of Sv39 page tables (a user table and a
//! kernel mirror of the same range), physical frames are reference counted
//! so `fork` can share them copy-on-write, and both the heap and `mmap`
//! regions are populated lazily from the page-fault handler.
//!
//! - [`mm`]: frame allocator, page tables, address spaces, COW, regions and
//!   the fault dispatcher
//! - [`fs`]: the file interface used for file-backed regions
//! - [`task`], [`trap`], [`syscall`]: thin process, trap and syscall glue

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
pub mod console;
pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod mm;
pub mod syscall;
pub mod task;
pub mod trap;

pub use error::VmError;
