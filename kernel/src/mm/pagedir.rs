//! Page directories
//!
//! A page directory maps page numbers to their PTEs. The multi-level walk
//! of real hardware is collapsed into a keyed map; the allocator only
//! depends on `lookup_page` semantics, never on the walk itself. TLB
//! shootdowns are modeled as a counter so tests can observe that
//! invalidation happens at the points the flush protocol requires.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::pte::Pte;
use super::VirtAddr;

/// A page directory: the root of one address space.
pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, Arc<Pte>>>,
    invalidations: AtomicU64,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            invalidations: AtomicU64::new(0),
        }
    }

    /// The PTE for `vaddr`, created empty if `create` is set and the page
    /// has none yet. Returns the same entry for the same page for the
    /// lifetime of the directory.
    pub fn lookup_page(&self, vaddr: VirtAddr, create: bool) -> Option<Arc<Pte>> {
        let mut entries = self.entries.lock();
        let key = vaddr.page_no();
        if create {
            Some(Arc::clone(
                entries.entry(key).or_insert_with(|| Arc::new(Pte::new())),
            ))
        } else {
            entries.get(&key).cloned()
        }
    }

    /// Flush TLB entries for this directory.
    pub fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of shootdowns so far.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}
