//! Physical memory window
//!
//! Boot-time memory discovery is out of scope, so the subsystem owns one
//! page-aligned RAM region and maps it at `PHYS_BASE`, which is what the
//! `ptov`/`vtop` arithmetic in the rest of the subsystem assumes. All
//! page contents go through the checked helpers below.
//!
//! Concurrent access to a page is sequenced by the allocator's locking
//! protocol (pool lock, per-frame lock, flushing bit); the helpers
//! themselves only guarantee that accesses stay inside the region.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

use super::{ptov, PhysAddr, VirtAddr, PAGE_SIZE, PHYS_BASE};

/// The machine's RAM, mapped contiguously at `PHYS_BASE`.
pub struct PhysMemory {
    base: *mut u8,
    pages: usize,
}

// SAFETY: the region is owned by this value for its whole lifetime and
// every access is bounds-checked; cross-thread ordering on page contents
// is provided by the pool/frame locks of the allocator, which are always
// taken around mutation of a live page.
unsafe impl Send for PhysMemory {}
// SAFETY: as above; shared references only hand out raw access through
// the bounds-checked helpers.
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// Allocate a zeroed region of `pages` pages.
    pub fn new(pages: usize) -> Self {
        assert!(pages > 0, "a machine needs memory");
        let layout = Self::layout(pages);
        // SAFETY: `layout` has non-zero size (pages > 0).
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self { base, pages }
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .expect("page-aligned layout is always valid")
    }

    /// Number of pages in the region.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Kernel virtual address of the first byte.
    pub fn base_kva(&self) -> VirtAddr {
        ptov(PhysAddr::new(0))
    }

    /// Raw pointer for `len` bytes at `kva`, bounds-checked.
    fn ptr_of(&self, kva: VirtAddr, len: usize) -> *mut u8 {
        let off = kva
            .as_usize()
            .checked_sub(PHYS_BASE)
            .expect("address below the physical window");
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.pages * PAGE_SIZE),
            "access past the end of physical memory"
        );
        // SAFETY: `off + len` is within the allocation checked above.
        unsafe { self.base.add(off) }
    }

    /// Fill `len` bytes at `kva` with `byte`.
    pub fn fill(&self, kva: VirtAddr, byte: u8, len: usize) {
        let ptr = self.ptr_of(kva, len);
        // SAFETY: `ptr` is valid for `len` bytes (bounds-checked).
        unsafe { core::ptr::write_bytes(ptr, byte, len) };
    }

    /// Zero `len` bytes at `kva`.
    pub fn zero(&self, kva: VirtAddr, len: usize) {
        self.fill(kva, 0, len);
    }

    /// Copy the bytes at `kva` into `buf`.
    pub fn copy_out(&self, kva: VirtAddr, buf: &mut [u8]) {
        let ptr = self.ptr_of(kva, buf.len());
        // SAFETY: `ptr` is valid for `buf.len()` bytes and `buf` is a
        // distinct allocation, so the ranges cannot overlap.
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
    }

    /// Copy `buf` to the bytes at `kva`.
    pub fn copy_in(&self, kva: VirtAddr, buf: &[u8]) {
        let ptr = self.ptr_of(kva, buf.len());
        // SAFETY: `ptr` is valid for `buf.len()` bytes and `buf` is a
        // distinct allocation, so the ranges cannot overlap.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        // SAFETY: `base` came from `alloc_zeroed` with the same layout.
        unsafe { dealloc(self.base, Self::layout(self.pages)) };
    }
}
