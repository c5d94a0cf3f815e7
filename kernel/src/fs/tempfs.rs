//! A minimal in-memory file store.
//!
//! The VM core needs exactly four things from a file: positional reads,
//! positional writes, a length, and `reopen`. Executable segments and
//! memory mappings hold a reopened handle, so a process closing the
//! descriptor it mapped from does not invalidate the mapping.

use crate::sync::Mutex;
use alloc::sync::Arc;
use alloc::vec::Vec;

struct Inode {
    data: Mutex<Vec<u8>>,
}

/// A handle on an in-memory file.
///
/// Handles created by [`File::reopen`] share the same inode, so writes made
/// through one are visible through every other.
pub struct File {
    inode: Arc<Inode>,
}

impl Clone for File {
    /// Cloning a handle reopens the file.
    fn clone(&self) -> Self {
        self.reopen()
    }
}

impl File {
    /// Creates a file holding `contents`.
    pub fn new(contents: Vec<u8>) -> Self {
        Self {
            inode: Arc::new(Inode {
                data: Mutex::new(contents),
            }),
        }
    }

    /// A second handle on the same inode.
    pub fn reopen(&self) -> Self {
        Self {
            inode: Arc::clone(&self.inode),
        }
    }

    /// The current length of the file in bytes.
    pub fn length(&self) -> usize {
        self.inode.data.lock().len()
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read, which is smaller than the
    /// buffer when the read runs off the end of the file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.inode.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = usize::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// Writes up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually written. Writes never grow the
    /// file: a write past the current length is truncated, like a write to
    /// a fixed-size file system file.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.inode.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = usize::min(buf.len(), data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}
