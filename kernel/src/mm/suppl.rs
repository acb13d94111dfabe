//! Supplemental page table
//!
//! For file-backed pages the PTE alone cannot say where the contents come
//! from. Each such page gets a supplemental entry naming the backing
//! file, the offset and how many bytes are real; the rest of the page is
//! zero. Entries are keyed by the identity of their PTE so the eviction
//! engine can go from an entry back to its class and file.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::fs::BackingFile;
use crate::mm::pte::Pte;
use crate::mm::PAGE_SIZE;

bitflags! {
    /// Classes of file-backed pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpteFlags: u32 {
        /// Code segment, read back from the executable, never written.
        const CODE = 1 << 0;
        /// Mmap'd file region, written back when dirty.
        const MMAP = 1 << 1;
    }
}

/// Supplemental entry for one file-backed user page.
pub struct Spte {
    /// The page-table entry this entry supplements.
    pub pte: Arc<Pte>,
    pub flags: SpteFlags,
    pub file: Arc<BackingFile>,
    /// Byte offset of the page within the file.
    pub offset: u64,
    /// Bytes of the page that come from the file; at most a page.
    pub bytes_read: usize,
}

impl Spte {
    pub fn new(
        pte: Arc<Pte>,
        flags: SpteFlags,
        file: Arc<BackingFile>,
        offset: u64,
        bytes_read: usize,
    ) -> Self {
        assert!(bytes_read <= PAGE_SIZE, "a supplemental entry spans one page");
        Self {
            pte,
            flags,
            file,
            offset,
            bytes_read,
        }
    }
}

/// Per-process table of supplemental entries.
pub struct SupplPageTable {
    entries: Mutex<BTreeMap<usize, Arc<Spte>>>,
}

impl SupplPageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn key(pte: &Arc<Pte>) -> usize {
        Arc::as_ptr(pte) as usize
    }

    /// Register `spte` under its PTE, replacing any previous entry.
    pub fn insert(&self, spte: Arc<Spte>) {
        let key = Self::key(&spte.pte);
        self.entries.lock().insert(key, spte);
    }

    /// The supplemental entry for `pte`, if the page is file-backed.
    pub fn get_spte(&self, pte: &Arc<Pte>) -> Option<Arc<Spte>> {
        self.entries.lock().get(&Self::key(pte)).cloned()
    }

    /// Drop the entry for `pte` (e.g. on munmap).
    pub fn remove(&self, pte: &Arc<Pte>) -> Option<Arc<Spte>> {
        self.entries.lock().remove(&Self::key(pte))
    }
}

impl Default for SupplPageTable {
    fn default() -> Self {
        Self::new()
    }
}
