//! The slice of the file system the VM core depends on.
//!
//! File-backed regions only ever move whole pages between a frame and a
//! byte offset of the backing file; the file system itself lives elsewhere.

/// An open file a region can be backed by.
///
/// Implementors serialize concurrent calls with their own per-file lock;
/// each `read_at`/`write_at` is one locked operation.
pub trait File: Send + Sync {
    /// Whether the file was opened for reading.
    fn readable(&self) -> bool;
    /// Whether the file was opened for writing.
    fn writable(&self) -> bool;
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// were read. Bytes past the end of the file are not touched.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
    /// Writes `buf` at `offset`, growing the file if needed; returns the
    /// number of bytes written.
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;
}
