//! Typed view over a page-table entry
//!
//! A PTE is one machine word: the low 12 bits are flags, the high bits
//! hold either the physical frame address (while present) or a swap slot
//! index (after eviction to swap). The word is atomic so that fault
//! handlers racing an in-flight eviction never observe a torn entry; the
//! *meaning* of the high bits is only stable while the flushing bit is
//! clear (observers wait, see the flush protocol in `evict`).

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{PhysAddr, SwapSlot, PG_BITS};

bitflags! {
    /// Flag bits in the low 12 bits of a PTE word.
    ///
    /// `PINNED`, `MAPPED_FILE` and `FLUSHING` live in the bits the
    /// hardware ignores, so the same word layout works as a real entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// The page is resident; the address field names its frame.
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Referenced since the bit was last cleared.
        const ACCESSED = 1 << 5;
        /// Written since the bit was last cleared.
        const DIRTY = 1 << 6;
        /// The backing frame must not be evicted.
        const PINNED = 1 << 9;
        /// Backing store is a file region, not swap.
        const MAPPED_FILE = 1 << 10;
        /// An eviction is writing this page out; wait before trusting the
        /// rest of the word.
        const FLUSHING = 1 << 11;
    }
}

/// Mask of the flag bits.
pub const PTE_FLAGS_MASK: u64 = 0xFFF;

/// Mask of the address field.
pub const PTE_ADDR_MASK: u64 = !PTE_FLAGS_MASK;

/// Decoded meaning of a PTE word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteContent {
    /// Resident; the frame lives at this physical address.
    Resident(PhysAddr),
    /// Not resident, backed by a file region described by the SPTE.
    FileBacked,
    /// Not resident, contents are in this swap slot.
    Swapped(SwapSlot),
    /// Never populated.
    Unmapped,
}

/// One page-table entry.
#[derive(Debug)]
pub struct Pte {
    word: AtomicU64,
}

impl Pte {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// The raw word.
    pub fn raw(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.raw() & PTE_FLAGS_MASK)
    }

    fn set(&self, flag: PteFlags, value: bool) {
        if value {
            self.word.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.word.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_accessed(&self) -> bool {
        self.flags().contains(PteFlags::ACCESSED)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PteFlags::DIRTY)
    }

    pub fn is_pinned(&self) -> bool {
        self.flags().contains(PteFlags::PINNED)
    }

    pub fn is_mapped_file(&self) -> bool {
        self.flags().contains(PteFlags::MAPPED_FILE)
    }

    pub fn is_flushing(&self) -> bool {
        self.flags().contains(PteFlags::FLUSHING)
    }

    pub fn set_present(&self, value: bool) {
        self.set(PteFlags::PRESENT, value);
    }

    pub fn set_accessed(&self, value: bool) {
        self.set(PteFlags::ACCESSED, value);
    }

    pub fn set_dirty(&self, value: bool) {
        self.set(PteFlags::DIRTY, value);
    }

    pub fn set_pinned(&self, value: bool) {
        self.set(PteFlags::PINNED, value);
    }

    pub fn set_mapped_file(&self, value: bool) {
        self.set(PteFlags::MAPPED_FILE, value);
    }

    pub fn set_flushing(&self, value: bool) {
        self.set(PteFlags::FLUSHING, value);
    }

    /// The address field, meaningful while present.
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.raw() & PTE_ADDR_MASK)
    }

    /// Drop the address field, keeping only the flag bits. Used on the
    /// swap path before the slot index is encoded.
    pub fn retain_flags(&self) {
        self.word.fetch_and(PTE_FLAGS_MASK, Ordering::AcqRel);
    }

    /// Encode a swap slot into the address field. The field must have
    /// been cleared with [`retain_flags`](Self::retain_flags) first.
    pub fn set_swap_slot(&self, slot: SwapSlot) {
        self.word
            .fetch_or((slot.index() as u64) << PG_BITS, Ordering::AcqRel);
    }

    /// Swap slot encoded in the address field, meaningful while not
    /// present and not file-mapped.
    pub fn swap_slot(&self) -> SwapSlot {
        SwapSlot::new((self.raw() >> PG_BITS) as usize)
    }

    /// Map the entry to a resident frame.
    ///
    /// Clears the accessed and dirty bits, keeps the pinned and
    /// mapped-file bits, and replaces everything else with the frame
    /// address, `PRESENT` and `extra`.
    pub fn install(&self, pa: PhysAddr, extra: PteFlags) {
        debug_assert_eq!(pa.as_u64() & PTE_FLAGS_MASK, 0);
        let keep = self.raw() & (PteFlags::PINNED | PteFlags::MAPPED_FILE).bits();
        self.word.store(
            pa.as_u64() | keep | (extra | PteFlags::PRESENT).bits(),
            Ordering::Release,
        );
    }

    /// Decode the word.
    pub fn content(&self) -> PteContent {
        let raw = self.raw();
        let flags = PteFlags::from_bits_truncate(raw & PTE_FLAGS_MASK);
        if flags.contains(PteFlags::PRESENT) {
            PteContent::Resident(PhysAddr::new(raw & PTE_ADDR_MASK))
        } else if flags.contains(PteFlags::MAPPED_FILE) {
            PteContent::FileBacked
        } else if raw == 0 {
            PteContent::Unmapped
        } else {
            // An evicted word always carries at least the accessed bit
            // (set during flush), so a non-zero word here is a swap
            // encoding even for slot 0.
            PteContent::Swapped(SwapSlot::new((raw >> PG_BITS) as usize))
        }
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::new()
    }
}
