//! Frame tables
//!
//! Each pool keeps one entry per physical frame recording which mapping
//! occupies it, plus the clock hand the eviction engine scans with. The
//! entry array is only ever touched under the pool lock; the per-frame
//! locks that pace eviction live next to it in the pool so they stay
//! reachable after the pool lock is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use super::pagedir::PageDirectory;
use super::pte::{Pte, PteFlags};
use super::suppl::Spte;
use super::{vtop, VirtAddr, PAGE_SIZE};

/// Back-reference from a physical frame to the mapping occupying it.
///
/// A frame holding an mmap'd file page is referenced through its
/// supplemental entry so the eviction engine can reach the backing file
/// without consulting the owning process.
#[derive(Clone)]
pub enum FrameRef {
    /// Kernel page, or user page whose PTE is referenced directly.
    DirectPte(Arc<Pte>),
    /// User page of an mmap'd file region.
    Mapped(Arc<Spte>),
}

impl FrameRef {
    /// The PTE behind the reference, direct or through the SPTE.
    pub fn pte(&self) -> &Arc<Pte> {
        match self {
            FrameRef::DirectPte(pte) => pte,
            FrameRef::Mapped(spte) => &spte.pte,
        }
    }
}

/// Frame table of one pool.
pub struct FrameTable {
    /// One entry per frame; `None` means the frame is free.
    frames: Vec<Option<FrameRef>>,
    /// Clock hand, in `[0, page_cnt)`.
    clock_cur: usize,
}

impl FrameTable {
    pub fn new(page_cnt: usize) -> Self {
        assert!(page_cnt > 0, "a frame table needs at least one frame");
        let mut frames = Vec::new();
        frames.resize_with(page_cnt, || None);
        Self {
            frames,
            clock_cur: 0,
        }
    }

    /// Bytes a table of `page_cnt` entries occupies, counting the
    /// per-frame locks kept alongside it. Used to reserve pool pages for
    /// the table itself at init.
    pub fn footprint(page_cnt: usize) -> usize {
        page_cnt * (size_of::<Option<FrameRef>>() + size_of::<spin::Mutex<()>>())
    }

    pub fn page_cnt(&self) -> usize {
        self.frames.len()
    }

    pub fn get(&self, idx: usize) -> Option<&FrameRef> {
        self.frames[idx].as_ref()
    }

    pub fn set(&mut self, idx: usize, backref: Option<FrameRef>) {
        self.frames[idx] = backref;
    }

    /// Clear the entry, returning the old back-reference.
    pub fn take(&mut self, idx: usize) -> Option<FrameRef> {
        self.frames[idx].take()
    }

    pub fn clock_cur(&self) -> usize {
        self.clock_cur
    }

    /// Advance the clock hand by one, wrapping at the pool size.
    pub fn advance_clock(&mut self) {
        self.clock_cur = (self.clock_cur + 1) % self.frames.len();
    }

    /// Number of free frames.
    pub fn free_cnt(&self) -> usize {
        self.frames.iter().filter(|f| f.is_none()).count()
    }

    /// Index of the first run of `cnt` consecutive free frames at or
    /// after `start`.
    pub fn scan_run(&self, start: usize, cnt: usize) -> Option<usize> {
        if cnt == 0 || cnt > self.frames.len() {
            return None;
        }
        let mut run = 0;
        let mut run_start = start;
        for idx in start..self.frames.len() {
            if self.frames[idx].is_none() {
                if run == 0 {
                    run_start = idx;
                }
                run += 1;
                if run == cnt {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Bind `cnt` frames starting at `start` to the kernel directory
    /// `pd`, mapping successive kernel virtual addresses from `base_kva`
    /// (the address of frame `start`).
    pub fn bind_kernel_run(
        &mut self,
        start: usize,
        cnt: usize,
        pd: &PageDirectory,
        base_kva: VirtAddr,
    ) {
        for k in 0..cnt {
            let kva = base_kva.add(k * PAGE_SIZE);
            let pte = pd
                .lookup_page(kva, true)
                .expect("creating a page-table entry cannot fail");
            pte.install(vtop(kva), PteFlags::WRITABLE);
            debug_assert!(self.frames[start + k].is_none());
            self.frames[start + k] = Some(FrameRef::DirectPte(pte));
        }
    }

    /// Re-point every occupied entry at the matching PTE of a rebuilt
    /// kernel directory. Kernel frames only carry direct references.
    pub fn change_pagedir(&mut self, pd: &PageDirectory, base_kva: VirtAddr) {
        for idx in 0..self.frames.len() {
            if self.frames[idx].is_none() {
                continue;
            }
            let kva = base_kva.add(idx * PAGE_SIZE);
            let pte = pd
                .lookup_page(kva, true)
                .expect("creating a page-table entry cannot fail");
            pte.install(vtop(kva), PteFlags::WRITABLE);
            self.frames[idx] = Some(FrameRef::DirectPte(pte));
        }
    }
}
