//! Swap device
//!
//! Slot-granular backing store for evicted anonymous pages: a word bitmap
//! of used slots plus the slot contents. Running out of swap is fatal;
//! the kernel has nowhere left to put the page.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::PAGE_SIZE;

/// Index of one page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

struct SwapInner {
    /// One bit per slot, 1 = used.
    used: Vec<u64>,
    /// Slot contents, `slot_cnt * PAGE_SIZE` bytes.
    data: Vec<u8>,
    used_cnt: usize,
}

/// The swap device.
pub struct SwapTable {
    slot_cnt: usize,
    inner: Mutex<SwapInner>,
}

impl SwapTable {
    pub fn new(slot_cnt: usize) -> Self {
        assert!(slot_cnt > 0, "swap device has no slots");
        Self {
            slot_cnt,
            inner: Mutex::new(SwapInner {
                used: vec![0; slot_cnt.div_ceil(64)],
                data: vec![0; slot_cnt * PAGE_SIZE],
                used_cnt: 0,
            }),
        }
    }

    pub fn slot_cnt(&self) -> usize {
        self.slot_cnt
    }

    /// Number of slots currently holding a page.
    pub fn used_slots(&self) -> usize {
        self.inner.lock().used_cnt
    }

    /// Claim a free slot.
    ///
    /// # Panics
    ///
    /// Panics when the device is full.
    pub fn allocate(&self) -> SwapSlot {
        let mut inner = self.inner.lock();
        let mut found = None;
        for (word_idx, word) in inner.used.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = word_idx * 64 + bit;
            if slot < self.slot_cnt {
                found = Some((word_idx, bit, slot));
            }
            break;
        }
        let Some((word_idx, bit, slot)) = found else {
            panic!("out of swap slots");
        };
        inner.used[word_idx] |= 1 << bit;
        inner.used_cnt += 1;
        SwapSlot::new(slot)
    }

    fn check_used(&self, inner: &SwapInner, slot: SwapSlot) {
        assert!(slot.index() < self.slot_cnt, "swap slot out of range");
        assert!(
            inner.used[slot.index() / 64] & (1 << (slot.index() % 64)) != 0,
            "swap slot {} is not allocated",
            slot.index()
        );
    }

    /// Store a page in `slot`.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) {
        assert_eq!(page.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        self.check_used(&inner, slot);
        let start = slot.index() * PAGE_SIZE;
        inner.data[start..start + PAGE_SIZE].copy_from_slice(page);
    }

    /// Read the page stored in `slot`.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) {
        assert_eq!(page.len(), PAGE_SIZE);
        let inner = self.inner.lock();
        self.check_used(&inner, slot);
        let start = slot.index() * PAGE_SIZE;
        page.copy_from_slice(&inner.data[start..start + PAGE_SIZE]);
    }

    /// Release `slot` for reuse.
    pub fn free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        self.check_used(&inner, slot);
        inner.used[slot.index() / 64] &= !(1 << (slot.index() % 64));
        inner.used_cnt -= 1;
    }
}
