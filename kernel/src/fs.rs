//! Backing-file model
//!
//! The eviction engine and the fault path only need positioned reads and
//! writes, so a file is a growable in-memory byte store behind a lock.
//! Real storage sits behind the same contract.

use alloc::vec::Vec;

use spin::Mutex;

/// An open file used as backing store for file-mapped pages.
pub struct BackingFile {
    data: Mutex<Vec<u8>>,
}

impl BackingFile {
    /// An empty file.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }

    /// A file pre-populated with `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Mutex::new(bytes.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Write `buf` at byte `offset`, growing the file if the write extends
    /// past the current end.
    pub fn write_at(&self, buf: &[u8], offset: u64) {
        let offset = offset as usize;
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; the tail of `buf` is untouched when the file
    /// ends early.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let offset = offset as usize;
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }
}

impl Default for BackingFile {
    fn default() -> Self {
        Self::new()
    }
}
