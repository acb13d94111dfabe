//! Page allocator
//!
//! Hands out memory in page-size (or page-multiple) chunks. System
//! memory is divided into two pools: the user pool holds user virtual
//! memory pages and is subject to eviction, the kernel pool holds
//! everything else and never is. The kernel keeps memory for its own
//! operations even when user processes are swapping hard.
//!
//! By default half of RAM goes to each pool, with the user half capped
//! by the `user_page_limit` construction parameter.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::KernelError;
use crate::process::Process;
use crate::sync::CondVar;

use super::frame_table::{FrameRef, FrameTable};
use super::pagedir::PageDirectory;
use super::phys::PhysMemory;
use super::pte::Pte;
use super::swap::SwapTable;
use super::{ptov, VirtAddr, PAGE_SIZE};

bitflags! {
    /// How to allocate pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool (kernel pool otherwise).
        const USER = 1 << 0;
        /// Zero the returned pages.
        const ZERO = 1 << 1;
        /// Panic instead of reporting failure.
        const ASSERT = 1 << 2;
        /// The binding refers to an mmap'd file region; store its SPTE in
        /// the frame table.
        const MMAP = 1 << 3;
    }
}

/// Which pool a kernel virtual address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Kernel,
    User,
}

/// Frame counts of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
}

/// A memory pool.
pub(crate) struct Pool {
    pub(crate) name: &'static str,
    /// Address of the pool's first usable page (past the frame-table
    /// reservation).
    pub(crate) base: VirtAddr,
    pub(crate) page_cnt: usize,
    /// The pool lock: guards the frame table and the clock hand.
    pub(crate) table: Mutex<FrameTable>,
    /// Per-frame eviction locks, reachable without the pool lock.
    pub(crate) frame_locks: Vec<Mutex<()>>,
}

impl Pool {
    /// Carve a pool out of `raw_page_cnt` pages starting at `base`,
    /// reserving leading pages for the frame table itself.
    ///
    /// # Panics
    ///
    /// Panics if the frame table does not fit or no usable pages remain.
    fn new(base: VirtAddr, raw_page_cnt: usize, name: &'static str) -> Self {
        let ft_pages = FrameTable::footprint(raw_page_cnt).div_ceil(PAGE_SIZE);
        assert!(
            ft_pages < raw_page_cnt,
            "not enough memory in {name} for frame table"
        );
        let page_cnt = raw_page_cnt - ft_pages;

        log::info!("{page_cnt} pages available in {name}");

        let mut frame_locks = Vec::new();
        frame_locks.resize_with(page_cnt, || Mutex::new(()));
        Self {
            name,
            base: base.add(ft_pages * PAGE_SIZE),
            page_cnt,
            table: Mutex::new(FrameTable::new(page_cnt)),
            frame_locks,
        }
    }

    pub(crate) fn contains(&self, kva: VirtAddr) -> bool {
        let page_no = kva.page_no();
        let start = self.base.page_no();
        page_no >= start && page_no < start + self.page_cnt
    }

    /// Frame index of a kernel virtual address inside this pool.
    pub(crate) fn page_index(&self, kva: VirtAddr) -> usize {
        debug_assert!(self.contains(kva));
        kva.page_no() - self.base.page_no()
    }

    /// Kernel virtual address of frame `idx`.
    pub(crate) fn kva_of(&self, idx: usize) -> VirtAddr {
        debug_assert!(idx < self.page_cnt);
        self.base.add(idx * PAGE_SIZE)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.page_cnt,
            free: self.table.lock().free_cnt(),
        }
    }
}

/// Leaf lock + condition variable pairing used by the flush protocol.
pub(crate) struct FlushGate {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: CondVar,
}

impl FlushGate {
    const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: CondVar::new(),
        }
    }
}

/// The paging subsystem: both pools, the swap device and the flush
/// gates. Constructed once at boot and passed by reference.
pub struct PageSubsystem {
    pub(crate) mem: PhysMemory,
    pub(crate) kernel_pool: Pool,
    pub(crate) user_pool: Pool,
    /// The kernel page directory kernel-pool frames are bound to.
    pub(crate) kernel_pd: Mutex<Arc<PageDirectory>>,
    pub(crate) swap: SwapTable,
    pub(crate) file_flush: FlushGate,
    pub(crate) swap_flush: FlushGate,
}

impl PageSubsystem {
    /// Initialize the page allocator over `ram_pages` pages of fresh RAM
    /// and a swap device of `swap_slots` slots. At most `user_page_limit`
    /// pages go to the user pool.
    pub fn new(ram_pages: usize, user_page_limit: usize, swap_slots: usize) -> Self {
        let mem = PhysMemory::new(ram_pages);
        let free_start = mem.base_kva();
        let free_pages = ram_pages;

        let user_pages = (free_pages / 2).min(user_page_limit);
        let kernel_pages = free_pages - user_pages;

        let kernel_pool = Pool::new(free_start, kernel_pages, "kernel pool");
        let user_pool = Pool::new(
            free_start.add(kernel_pages * PAGE_SIZE),
            user_pages,
            "user pool",
        );

        Self {
            mem,
            kernel_pool,
            user_pool,
            kernel_pd: Mutex::new(Arc::new(PageDirectory::new())),
            swap: SwapTable::new(swap_slots),
            file_flush: FlushGate::new(),
            swap_flush: FlushGate::new(),
        }
    }

    /// The physical memory window.
    pub fn mem(&self) -> &PhysMemory {
        &self.mem
    }

    /// The swap device.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Frame counts for `kind`.
    pub fn pool_stats(&self, kind: PoolKind) -> PoolStats {
        self.pool(kind).stats()
    }

    /// First usable page of the pool `kind`.
    pub fn pool_base(&self, kind: PoolKind) -> VirtAddr {
        self.pool(kind).base
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Kernel => &self.kernel_pool,
            PoolKind::User => &self.user_pool,
        }
    }

    fn pool_for(&self, flags: AllocFlags) -> &Pool {
        if flags.contains(AllocFlags::USER) {
            &self.user_pool
        } else {
            &self.kernel_pool
        }
    }

    /// Obtain `page_cnt` contiguous free pages and return the kernel
    /// virtual address of the first.
    ///
    /// `USER` selects the user pool; user allocations are one page at a
    /// time and bind the frame to the caller's mapping for `upage`
    /// (creating and pinning the PTE). Kernel allocations take no
    /// `upage` and bind the run to the kernel page directory. `ZERO`
    /// zero-fills the pages after the pool lock is dropped. On failure
    /// the error reports the pool, unless `ASSERT` turns it into a
    /// panic.
    pub fn get_multiple(
        &self,
        flags: AllocFlags,
        page_cnt: usize,
        cur: &Process,
        upage: Option<VirtAddr>,
    ) -> Result<VirtAddr, KernelError> {
        if page_cnt == 0 {
            return Err(KernelError::ZeroSizedAllocation);
        }
        let pool = self.pool_for(flags);

        let found = {
            let mut table = pool.table.lock();
            let found = table.scan_run(0, page_cnt);
            if let Some(idx) = found {
                if flags.contains(AllocFlags::USER) {
                    let upage = upage.expect("user allocations name a user virtual address");
                    assert!(upage.is_user(), "not a user virtual address");
                    assert_eq!(page_cnt, 1, "user processes get one page at a time");

                    let _frame_guard = pool.frame_locks[idx].lock();
                    let backref = self.user_backref(flags, cur, upage);
                    table.set(idx, Some(backref));
                } else {
                    assert!(upage.is_none(), "kernel allocations take no user address");
                    let kpd = Arc::clone(&self.kernel_pd.lock());
                    table.bind_kernel_run(idx, page_cnt, &kpd, pool.kva_of(idx));
                }
            }
            found
        };

        match found {
            Some(idx) => {
                let kva = pool.kva_of(idx);
                if flags.contains(AllocFlags::ZERO) {
                    self.mem.zero(kva, page_cnt * PAGE_SIZE);
                }
                Ok(kva)
            }
            None => {
                if flags.contains(AllocFlags::ASSERT) {
                    panic!("get_multiple: out of pages in {}", pool.name);
                }
                Err(KernelError::OutOfFrames {
                    pool: pool.name,
                    requested: page_cnt,
                })
            }
        }
    }

    /// Locate (or create) the caller's PTE for `upage`, pin it, and build
    /// the frame back-reference required by `flags`.
    fn user_backref(&self, flags: AllocFlags, cur: &Process, upage: VirtAddr) -> FrameRef {
        if flags.contains(AllocFlags::MMAP) {
            let pte = cur
                .pagedir
                .lookup_page(upage, false)
                .expect("mmap binding requires an existing page-table entry");
            assert!(
                pte.is_mapped_file(),
                "mmap binding requires a file-mapped entry"
            );
            pte.set_pinned(true);
            let spte = cur
                .suppl_pt
                .get_spte(&pte)
                .expect("file-mapped page has no supplemental entry");
            FrameRef::Mapped(spte)
        } else {
            let pte = cur
                .pagedir
                .lookup_page(upage, true)
                .expect("creating a page-table entry cannot fail");
            pte.set_pinned(true);
            FrameRef::DirectPte(pte)
        }
    }

    /// Obtain a single free page and return its kernel virtual address.
    ///
    /// When the user pool is exhausted this falls into the eviction
    /// engine; kernel-pool exhaustion is fatal, kernel memory is never
    /// evicted.
    pub fn get_page(
        &self,
        flags: AllocFlags,
        cur: &Process,
        upage: Option<VirtAddr>,
    ) -> Result<VirtAddr, KernelError> {
        if let Some(upage) = upage {
            assert!(upage.is_page_aligned(), "user address must be page-aligned");
        }

        match self.get_multiple(flags, 1, cur, upage) {
            Ok(kva) => Ok(kva),
            Err(_) if flags.contains(AllocFlags::USER) => {
                let upage = upage.expect("user allocations name a user virtual address");
                Ok(self.evict_and_get_page(flags, cur, upage))
            }
            Err(_) => panic!("out of kernel memory pages"),
        }
    }

    /// Free the `page_cnt` pages starting at `kva`.
    ///
    /// # Panics
    ///
    /// Panics if `kva` is not page-aligned, lies in neither pool, or any
    /// page in the run is already free.
    pub fn free_multiple(&self, kva: VirtAddr, page_cnt: usize) {
        assert!(kva.is_page_aligned(), "freed address must be page-aligned");
        if page_cnt == 0 {
            return;
        }

        let pool = match self.pool_of(kva) {
            Some(kind) => self.pool(kind),
            None => panic!("freeing {:#x}: address in no pool", kva.as_usize()),
        };
        let idx = pool.page_index(kva);
        assert!(idx + page_cnt <= pool.page_cnt, "run extends past the pool");

        // Make stale reuse loud before the frames go back on the free
        // list.
        if cfg!(debug_assertions) {
            self.mem.fill(kva, 0xcc, page_cnt * PAGE_SIZE);
        }

        let mut table = pool.table.lock();
        for k in 0..page_cnt {
            assert!(
                table.take(idx + k).is_some(),
                "double free of frame {} in {}",
                idx + k,
                pool.name
            );
        }
    }

    /// Free the page at `kva`.
    pub fn free_page(&self, kva: VirtAddr) {
        self.free_multiple(kva, 1);
    }

    /// Which pool, if any, `kva` was allocated from.
    pub fn pool_of(&self, kva: VirtAddr) -> Option<PoolKind> {
        if self.kernel_pool.contains(kva) {
            Some(PoolKind::Kernel)
        } else if self.user_pool.contains(kva) {
            Some(PoolKind::User)
        } else {
            None
        }
    }

    /// Re-point every kernel-pool frame at the matching PTE of a rebuilt
    /// kernel page directory.
    pub fn kernel_pool_change_pd(&self, pd: &Arc<PageDirectory>) {
        let mut table = self.kernel_pool.table.lock();
        table.change_pagedir(pd, self.kernel_pool.base);
        *self.kernel_pd.lock() = Arc::clone(pd);
    }

    /// The per-frame lock of the user-pool frame a user PTE is resident
    /// in. Page-fault handlers take it before touching a frame that may
    /// be under eviction.
    pub fn user_frame_lock_for(&self, pte: &Pte) -> &Mutex<()> {
        let pa = pte.phys_addr();
        assert!(pa.as_u64() != 0, "entry does not name a frame");
        let kva = ptov(pa);
        assert!(
            self.user_pool.contains(kva),
            "entry does not name a user-pool frame"
        );
        &self.user_pool.frame_locks[self.user_pool.page_index(kva)]
    }

    /// Block while `pte` is being flushed by an evictor. On return the
    /// entry's contents are authoritative (until the caller races the
    /// next eviction; callers pin or hold the frame lock to prevent
    /// that).
    pub fn wait_while_flushing(&self, pte: &Pte) {
        let gate = if pte.is_mapped_file() {
            &self.file_flush
        } else {
            &self.swap_flush
        };
        let mut guard = gate.lock.lock();
        while pte.is_flushing() {
            guard = gate.cond.wait(&gate.lock, guard);
        }
        drop(guard);
    }
}
