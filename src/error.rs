//! Recoverable errors reported by the VM core.
//!
//! Kernel contract violations (double free, remap, a live leaf under a
//! table being freed, ...) are not represented here: they `panic!`.

use core::fmt;

/// A failure the caller can report back to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free physical frame was left.
    OutOfMemory,
    /// No region covers the requested range.
    NoSuchRegion,
    /// The access is not allowed by the mapping's protection.
    PermissionDenied,
    /// A malformed request (alignment, length, flags).
    InvalidArgument,
    /// Every region slot of the process is in use.
    RegionTableFull,
    /// No gap of the requested size between the heap and `MMAP_BASE`.
    NoVirtualSpace,
    /// The range intersects an existing region.
    Overlap,
    /// A user pointer does not translate to an accessible page.
    BadAddress,
    /// The executable image could not be loaded.
    BadElf(&'static str),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::NoSuchRegion => write!(f, "no such region"),
            VmError::PermissionDenied => write!(f, "permission denied"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::RegionTableFull => write!(f, "region table full"),
            VmError::NoVirtualSpace => write!(f, "no free virtual range"),
            VmError::Overlap => write!(f, "range overlaps a region"),
            VmError::BadAddress => write!(f, "bad user address"),
            VmError::BadElf(why) => write!(f, "bad elf: {}", why),
        }
    }
}
