//! Constants used in the virtual-memory core

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;
/// Entries in one page-table page.
pub const PTE_PER_PAGE: usize = 512;

/// One beyond the highest virtual address Sv39 lets us use.
/// MAXVA is one bit less than the max allowed by Sv39, to avoid having to
/// sign-extend virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
/// User mappings live strictly below this address; everything above it in
/// a kernel-mirror table belongs to the global kernel space.
pub const MAXUVA: usize = 0x8000_0000;
/// `mmap` regions are placed downward from here.
pub const MMAP_BASE: usize = 0x6000_0000;
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

/// Lowest address the lazy heap will populate; page 0 is never faulted in.
pub const LAZY_FLOOR: usize = PAGE_SIZE;

/// Regions per process.
pub const NVMA: usize = 16;

/// Fill byte written over a frame when it is handed out.
pub const ALLOC_JUNK: u8 = 0x05;
/// Fill byte written over a frame when it returns to the free list.
pub const FREE_JUNK: u8 = 0x01;
