//! Page-fault resolution
//!
//! Restores a non-resident user page: back from its swap slot, re-read
//! from its backing file, or zero-filled on first touch. The handler
//! first waits out any eviction still flushing the entry; after that the
//! PTE word is authoritative and the new frame arrives pinned from the
//! allocator, so no evictor can steal it before the contents and the
//! mapping are in place.

use crate::error::KernelError;
use crate::process::Process;

use super::palloc::{AllocFlags, PageSubsystem};
use super::pte::{PteContent, PteFlags};
use super::{vtop, VirtAddr, PAGE_SIZE};

/// Resolve a user page fault at page-aligned `upage`.
///
/// Returns `Ok` once the page is resident (including when a racing fault
/// already restored it). Faults on addresses the process never mapped
/// report [`KernelError::UnmappedAddress`].
pub fn handle_user_fault(
    sys: &PageSubsystem,
    cur: &Process,
    upage: VirtAddr,
) -> Result<(), KernelError> {
    assert!(upage.is_page_aligned(), "fault address must be page-aligned");
    assert!(upage.is_user(), "not a user virtual address");

    let pte = cur
        .pagedir
        .lookup_page(upage, false)
        .ok_or(KernelError::UnmappedAddress {
            addr: upage.as_usize(),
        })?;

    sys.wait_while_flushing(&pte);

    match pte.content() {
        PteContent::Resident(_) => Ok(()), // a racing fault restored it
        PteContent::FileBacked => {
            let spte = cur
                .suppl_pt
                .get_spte(&pte)
                .expect("file-mapped page has no supplemental entry");

            // File-backed frames are always bound through their SPTE so
            // an evictor can reach the file without this process.
            let kva = sys.get_page(AllocFlags::USER | AllocFlags::MMAP, cur, Some(upage))?;

            let mut buf = [0u8; PAGE_SIZE];
            let n = spte.file.read_at(&mut buf[..spte.bytes_read], spte.offset);
            log::trace!(
                "fault {:#x}: {n} bytes from file offset {}",
                upage.as_usize(),
                spte.offset
            );
            sys.mem().copy_in(kva, &buf);

            pte.install(vtop(kva), PteFlags::WRITABLE | PteFlags::USER);
            pte.set_pinned(false);
            Ok(())
        }
        PteContent::Swapped(slot) => {
            let kva = sys.get_page(AllocFlags::USER, cur, Some(upage))?;

            let mut buf = [0u8; PAGE_SIZE];
            sys.swap().read(slot, &mut buf);
            sys.swap().free(slot);
            sys.mem().copy_in(kva, &buf);

            pte.install(vtop(kva), PteFlags::WRITABLE | PteFlags::USER);
            pte.set_pinned(false);
            Ok(())
        }
        PteContent::Unmapped => {
            // First touch of an anonymous page.
            let kva = sys.get_page(AllocFlags::USER | AllocFlags::ZERO, cur, Some(upage))?;
            pte.install(vtop(kva), PteFlags::WRITABLE | PteFlags::USER);
            pte.set_pinned(false);
            Ok(())
        }
    }
}
