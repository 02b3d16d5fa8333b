//! Flat, lock-free page table.
//!
//! One atomic word per guest page. Address bits are written by map/unmap (which callers never run
//! concurrently with other operations on the same range); tag bits are mutated concurrently through
//! compare-and-swap loops that only ever touch a single entry.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU64;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU64;

use std::sync::atomic::Ordering;

use crate::pte::{Pte, PTE_TAG_MASK, PTE_TAG_SHIFT};

pub(crate) struct PageTable {
    entries: Box<[AtomicU64]>,
}

impl PageTable {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            entries: (0..pages).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of entries (guest pages).
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    #[inline]
    fn entry(&self, page: u64) -> Option<&AtomicU64> {
        usize::try_from(page).ok().and_then(|page| self.entries.get(page))
    }

    /// Entry for `page`, or [`Pte::UNMAPPED`] past the end of the table.
    #[inline]
    pub(crate) fn load(&self, page: u64) -> Pte {
        match self.entry(page) {
            Some(entry) => Pte::from_raw(entry.load(Ordering::Acquire)),
            None => Pte::UNMAPPED,
        }
    }

    /// Overwrites the whole entry, tag included. `page` must be inside the table.
    #[inline]
    pub(crate) fn store(&self, page: u64, pte: Pte) {
        let entry = self.entry(page);
        debug_assert!(entry.is_some(), "page {page} outside the page table");
        if let Some(entry) = entry {
            entry.store(pte.raw(), Ordering::Release);
        }
    }

    /// Atomically clears the armed bits of `mask` on `page`.
    ///
    /// Returns `true` if this call observed at least one bit of `mask` armed and was the one to
    /// clear it. Returns `false` if nothing was armed. Concurrent callers racing on the same armed
    /// entry see exactly one `true`.
    pub(crate) fn try_disarm(&self, page: u64, mask: u64) -> bool {
        let Some(entry) = self.entry(page) else {
            return false;
        };

        let mut current = entry.load(Ordering::Acquire);
        loop {
            let pte = Pte::from_raw(current);
            if !pte.is_armed(mask) {
                return false;
            }

            test_yield();

            match entry.compare_exchange_weak(
                current,
                pte.without_bits(mask).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically replaces the tag of a mapped `page`. Unmapped entries are left alone.
    pub(crate) fn set_tag(&self, page: u64, tag: u16) {
        let Some(entry) = self.entry(page) else {
            return;
        };

        let mut current = entry.load(Ordering::Acquire);
        loop {
            let pte = Pte::from_raw(current);
            if !pte.is_mapped() || pte.tag() == tag {
                return;
            }

            test_yield();

            match entry.compare_exchange_weak(
                current,
                pte.with_tag(tag).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

const _: () = assert!(PTE_TAG_MASK >> PTE_TAG_SHIFT == 0xffff);

#[cfg(all(test, feature = "loom"))]
#[inline]
fn test_yield() {
    loom::thread::yield_now();
}

#[cfg(all(test, not(feature = "loom")))]
#[inline]
fn test_yield() {
    std::thread::yield_now();
}

#[cfg(not(test))]
#[inline]
fn test_yield() {}
