//! Eviction engine
//!
//! Clock second-chance replacement over the user pool. Victim selection
//! runs under the pool lock and takes per-frame locks by try-lock only;
//! once a victim is chosen the pool lock is dropped and the per-frame
//! lock alone serializes the flush. Fault handlers racing the flush wait
//! on the flush gates until the flushing bit clears.
//!
//! Lock order: pool lock → per-frame lock (try-lock inside the loop) →
//! flush lock. The flush locks are leaves; no I/O happens under them.

use alloc::sync::Arc;

use crate::process::Process;
use crate::sync::relinquish;

use super::frame_table::FrameRef;
use super::palloc::{AllocFlags, PageSubsystem};
use super::pte::Pte;
use super::suppl::{Spte, SpteFlags};
use super::{ptov, VirtAddr, PAGE_SIZE};

impl PageSubsystem {
    /// Page out a user frame and hand it to the caller's mapping for
    /// `upage`, returning the frame's kernel virtual address.
    ///
    /// Blocks until a victim (or a freed frame) is available; the caller
    /// established that the pool had no free run.
    pub(crate) fn evict_and_get_page(
        &self,
        flags: AllocFlags,
        cur: &Process,
        upage: VirtAddr,
    ) -> VirtAddr {
        debug_assert!(flags.contains(AllocFlags::USER));
        let pool = &self.user_pool;

        // Prepare the new back-reference before taking the pool lock.
        // The entry is pinned right away; it is not linked from any frame
        // yet, so no other evictor can see it.
        let pte_new = cur
            .pagedir
            .lookup_page(upage, true)
            .expect("creating a page-table entry cannot fail");
        pte_new.set_pinned(true);
        let fte_new = if pte_new.is_mapped_file() {
            let spte = cur
                .suppl_pt
                .get_spte(&pte_new)
                .expect("file-mapped page has no supplemental entry");
            if flags.contains(AllocFlags::MMAP) {
                FrameRef::Mapped(spte)
            } else {
                FrameRef::DirectPte(Arc::clone(&pte_new))
            }
        } else {
            FrameRef::DirectPte(Arc::clone(&pte_new))
        };

        let mut table = pool.table.lock();
        // Clock steps since the loop last made progress (freed or
        // unpinned frame seen, or an accessed bit spent). Two laps of
        // nothing but pinned/contended frames means everything is pinned
        // for now: back off outside the pool lock so pinning threads can
        // run, then rescan.
        let mut stalled = 0usize;
        loop {
            if stalled >= 2 * pool.page_cnt {
                drop(table);
                relinquish();
                table = pool.table.lock();
                stalled = 0;
            }

            let clock_cur = table.clock_cur();
            let kva = pool.kva_of(clock_cur);

            // A frame freed since the failed scan shows up here; take it.
            let Some(fte_old) = table.get(clock_cur).cloned() else {
                table.set(clock_cur, Some(fte_new));
                table.advance_clock();
                drop(table);
                if flags.contains(AllocFlags::ZERO) {
                    self.mem.zero(kva, PAGE_SIZE);
                }
                return kva;
            };

            let (pte_old, spte_old) = decode_backref(&fte_old);

            // Another evictor owns this frame; skip it without giving up
            // the pool lock.
            let Some(frame_guard) = pool.frame_locks[clock_cur].try_lock() else {
                table.advance_clock();
                stalled += 1;
                continue;
            };

            if pte_old.is_pinned() {
                table.advance_clock();
                drop(frame_guard);
                stalled += 1;
                continue;
            }

            assert!(pte_old.is_present(), "occupied frame with a non-resident entry");
            assert_eq!(
                ptov(pte_old.phys_addr()),
                kva,
                "frame table and page table disagree about the frame"
            );

            // Second chance: recently used pages get their accessed bit
            // spent instead of being evicted.
            if pte_old.is_accessed() {
                pte_old.set_accessed(false);
                cur.pagedir.invalidate();
                table.advance_clock();
                drop(frame_guard);
                stalled = 0;
                continue;
            }

            // Victim found. Install the new binding, give up the pool
            // lock, and flush under the per-frame lock alone.
            table.set(clock_cur, Some(fte_new));
            table.advance_clock();
            drop(table);

            log::debug!(
                "evicting frame {clock_cur} of {} ({:#x})",
                pool.name,
                kva.as_usize()
            );
            self.flush_victim(&pte_old, spte_old.as_ref(), cur, kva);
            drop(frame_guard);

            if flags.contains(AllocFlags::ZERO) {
                self.mem.zero(kva, PAGE_SIZE);
            }
            return kva;
        }
    }

    /// Write the victim out to its backing store. Called with the
    /// victim's per-frame lock held and no other lock.
    fn flush_victim(
        &self,
        pte_old: &Arc<Pte>,
        spte_old: Option<&Arc<Spte>>,
        cur: &Process,
        kva: VirtAddr,
    ) {
        if pte_old.is_mapped_file() {
            {
                let _gate = self.file_flush.lock.lock();
                pte_old.set_flushing(true);
                // A concurrent re-access must stay visible once the page
                // comes back.
                pte_old.set_accessed(true);
                pte_old.set_present(false);
                cur.pagedir.invalidate();
            }

            let spte = spte_old.expect("file-mapped victim reached through a direct reference");
            // Data pages become ordinary memory pages once loaded; only
            // code and mmap pages flush to a file.
            assert!(
                spte.flags.intersects(SpteFlags::CODE | SpteFlags::MMAP),
                "anonymous page on the file flush path"
            );
            if spte.flags.contains(SpteFlags::MMAP) && pte_old.is_dirty() {
                assert_eq!(spte.flags, SpteFlags::MMAP);
                let mut buf = [0u8; PAGE_SIZE];
                self.mem.copy_out(kva, &mut buf[..spte.bytes_read]);
                spte.file.write_at(&buf[..spte.bytes_read], spte.offset);
            }

            {
                let _gate = self.file_flush.lock.lock();
                pte_old.set_flushing(false);
                self.file_flush.cond.broadcast();
            }
        } else {
            let slot;
            {
                let _gate = self.swap_flush.lock.lock();
                pte_old.set_flushing(true);
                pte_old.set_accessed(true);
                pte_old.set_present(false);
                cur.pagedir.invalidate();
                // Replace the frame address with the swap slot.
                pte_old.retain_flags();
                slot = self.swap.allocate();
                pte_old.set_swap_slot(slot);
            }

            let mut buf = [0u8; PAGE_SIZE];
            self.mem.copy_out(kva, &mut buf);
            self.swap.write(slot, &buf);

            {
                let _gate = self.swap_flush.lock.lock();
                pte_old.set_flushing(false);
                self.swap_flush.cond.broadcast();
            }
        }
    }
}

/// The PTE (and SPTE, for mapped frames) behind a back-reference.
fn decode_backref(fte: &FrameRef) -> (Arc<Pte>, Option<Arc<Spte>>) {
    match fte {
        FrameRef::DirectPte(pte) => (Arc::clone(pte), None),
        FrameRef::Mapped(spte) => {
            assert!(
                spte.pte.is_mapped_file(),
                "supplemental reference to a non-file entry"
            );
            (Arc::clone(&spte.pte), Some(Arc::clone(spte)))
        }
    }
}
