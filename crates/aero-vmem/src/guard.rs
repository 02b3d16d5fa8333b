//! Software guard pages.
//!
//! Host guard pages would trap into a signal handler, and the emulator cannot re-enter its
//! tracking code from there. Instead every access path asks the page table whether the pages it
//! is about to touch are armed, using the tag bits of each PTE.

use std::sync::Arc;

use tracing::trace;

use crate::address_space::{page_span, AddressSpace};
use crate::backing::BackingStore;
use crate::page_table::PageTable;
use crate::pte::{guard_check_mask, MemoryPermission};
use crate::tracking::TrackingEngine;
use crate::PAGE_BITS;

/// Handle onto an address space's page table that can arm and disarm guards.
///
/// Tracking engines receive one at construction so they can re-protect pages after a consumer has
/// synchronized, without holding a reference to the address space itself.
#[derive(Clone)]
pub struct GuardProtector {
    page_table: Arc<PageTable>,
}

impl GuardProtector {
    pub(crate) fn new(page_table: Arc<PageTable>) -> Self {
        Self { page_table }
    }

    /// Size in bytes of the address space this protector guards.
    #[inline]
    pub fn address_space_size(&self) -> u64 {
        self.page_table.len() << PAGE_BITS
    }

    /// Sets the guard tag of every mapped page overlapping `[va, va + size)` to the inverse of
    /// `permission`. Unmapped pages and pages past the end of the address space are skipped.
    pub fn reprotect(&self, va: u64, size: u64, permission: MemoryPermission) {
        let tag = permission.guard_tag();
        let (first, count) = page_span(va, size);
        let end = first.saturating_add(count).min(self.page_table.len());
        for page in first..end {
            self.page_table.set_tag(page, tag);
        }
        trace!(va, size, ?permission, "reprotect");
    }

    /// Finds the first page in the range that is armed for this kind of access and disarms it.
    ///
    /// Returns `true` if this call consumed an armed guard, in which case the caller owes the
    /// tracking engine exactly one event. Pages after the first armed one are left untouched.
    pub(crate) fn claim_first_armed(&self, va: u64, size: u64, write: bool) -> bool {
        let mask = guard_check_mask(write);
        let (first, count) = page_span(va, size);
        let end = first.saturating_add(count).min(self.page_table.len());
        (first..end).any(|page| self.page_table.try_disarm(page, mask))
    }
}

impl<B: BackingStore, E: TrackingEngine> AddressSpace<B, E> {
    /// Reports an access to `[va, va + size)` if any page in it is still armed.
    ///
    /// At most one `notify_virtual_memory_touched` is emitted per call, covering the whole
    /// requested range, and only by the thread that consumed the guard. The guard of the first armed
    /// page is cleared; later pages keep theirs and will report on a future access.
    pub fn mark_region_as_modified(&self, va: u64, size: u64, write: bool) {
        if size == 0 {
            return;
        }
        if self.protector().claim_first_armed(va, size, write) {
            trace!(va, size, write, "guarded access");
            self.tracking().notify_virtual_memory_touched(va, size, write);
        }
    }

    /// Arms or disarms the software guards of `[va, va + size)`.
    ///
    /// `permission` is what the guest may do without being reported: `READ_WRITE` opens the pages,
    /// `READ` reports the next write, and the empty set reports any access.
    pub fn reprotect(&self, va: u64, size: u64, permission: MemoryPermission) {
        self.protector().reprotect(va, size, permission);
    }
}
