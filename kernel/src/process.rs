//! Process view consumed by the memory subsystem
//!
//! The allocator needs exactly two things from the current thread: its
//! page directory and its supplemental page table. Scheduling is out of
//! scope, so callers pass this view explicitly instead of the subsystem
//! reading a thread-local.

use alloc::sync::Arc;

use crate::mm::pagedir::PageDirectory;
use crate::mm::suppl::SupplPageTable;

/// The memory-management slice of a process control block.
pub struct Process {
    /// Hardware page directory of the process.
    pub pagedir: Arc<PageDirectory>,
    /// Supplemental page table describing file-backed pages.
    pub suppl_pt: SupplPageTable,
}

impl Process {
    pub fn new() -> Self {
        Self {
            pagedir: Arc::new(PageDirectory::new()),
            suppl_pt: SupplPageTable::new(),
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}
