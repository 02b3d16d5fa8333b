use std::sync::Arc;

use tracing::{debug, trace};

use crate::backing::{BackingError, BackingStore};
use crate::error::{Result, VmemError};
use crate::guard::GuardProtector;
use crate::options::AddressSpaceOptions;
use crate::page_table::PageTable;
use crate::pte::{Pte, MAX_PHYSICAL_ADDRESS};
use crate::tracking::region_tracker::RegionTracker;
use crate::tracking::TrackingEngine;
use crate::{PAGE_BITS, PAGE_MASK, PAGE_SIZE, PTE_SIZE};

/// Page index of `va` and the number of pages overlapped by `[va, va + size)`.
#[inline]
pub(crate) fn page_span(va: u64, size: u64) -> (u64, u64) {
    let first = va >> PAGE_BITS;
    if size == 0 {
        return (first, 0);
    }
    let last = va.saturating_add(size - 1) >> PAGE_BITS;
    (first, last - first + 1)
}

/// A guest virtual address space backed by a single host buffer.
///
/// All operations take `&self` and may run concurrently from several threads, with one caveat:
/// `map`/`unmap` of a range must not race with any other operation on that same range. Direct
/// views into the backing store (`get_span`, `get_mutable_reference`, `get_writable_region`) need
/// `&mut self`, which rules out concurrent writers for as long as the view lives.
pub struct AddressSpace<B: BackingStore, E: TrackingEngine = RegionTracker> {
    pub(crate) backing: B,
    pub(crate) page_table: Arc<PageTable>,
    protector: GuardProtector,
    tracking: E,
    address_space_bits: u32,
    address_space_size: u64,
    pub(crate) track_reads: bool,
}

impl<B: BackingStore> AddressSpace<B, RegionTracker> {
    /// Address space covering at least `size` bytes, tracked by a [`RegionTracker`].
    pub fn new(backing: B, size: u64) -> Result<Self> {
        Self::with_options(backing, AddressSpaceOptions::new(size))
    }

    pub fn with_options(backing: B, options: AddressSpaceOptions) -> Result<Self> {
        Self::with_tracking(backing, options, RegionTracker::new)
    }
}

impl<B: BackingStore, E: TrackingEngine> AddressSpace<B, E> {
    /// Builds the page table and binds a tracking engine to it.
    ///
    /// The address space size is the smallest power of two number of pages covering
    /// `options.size`; `make_engine` receives the guard protector for the new page table.
    pub fn with_tracking<F>(backing: B, options: AddressSpaceOptions, make_engine: F) -> Result<Self>
    where
        F: FnOnce(GuardProtector) -> E,
    {
        let requested = options.size;
        let address_space_size = requested
            .max(PAGE_SIZE)
            .checked_next_power_of_two()
            .ok_or(VmemError::AddressSpaceTooLarge { size: requested })?;
        let address_space_bits = address_space_size.trailing_zeros();

        let pages = usize::try_from(address_space_size >> PAGE_BITS)
            .map_err(|_| VmemError::AddressSpaceTooLarge { size: requested })?;
        let page_table = Arc::new(PageTable::new(pages));
        let protector = GuardProtector::new(page_table.clone());
        let tracking = make_engine(protector.clone());

        debug!(
            requested,
            address_space_size,
            address_space_bits,
            pages,
            page_table_bytes = pages.saturating_mul(PTE_SIZE),
            backing_size = backing.size(),
            "created guest address space"
        );

        Ok(Self {
            backing,
            page_table,
            protector,
            tracking,
            address_space_bits,
            address_space_size,
            track_reads: options.track_reads,
        })
    }

    /// Size of the address space in bytes (always a power of two, at least one page).
    #[inline]
    pub fn address_space_size(&self) -> u64 {
        self.address_space_size
    }

    /// `log2(address_space_size())`.
    #[inline]
    pub fn address_space_bits(&self) -> u32 {
        self.address_space_bits
    }

    #[inline]
    pub fn page_count(&self) -> u64 {
        self.page_table.len()
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn tracking(&self) -> &E {
        &self.tracking
    }

    pub fn protector(&self) -> &GuardProtector {
        &self.protector
    }

    /// Maps `size` bytes at `va` to backing store offset `pa`. All three must be page-aligned.
    ///
    /// Remapping an already-mapped page replaces its target. Guards of the affected pages are
    /// reset to open; the tracking engine is notified once all entries are written.
    pub fn map(&self, va: u64, pa: u64, size: u64) -> Result<()> {
        debug_assert_eq!(va & PAGE_MASK, 0, "unaligned va 0x{va:x}");
        debug_assert_eq!(pa & PAGE_MASK, 0, "unaligned pa 0x{pa:x}");
        debug_assert_eq!(size & PAGE_MASK, 0, "unaligned size 0x{size:x}");

        if !self.validate_range(va, size) {
            return Err(VmemError::InvalidMemoryRegion { va, size });
        }
        let pa_end = pa
            .checked_add(size)
            .filter(|&end| end <= MAX_PHYSICAL_ADDRESS + 1)
            .ok_or(VmemError::PhysicalOutOfRange { pa, size })?;
        let backing_size = self.backing.size();
        if pa_end > backing_size {
            return Err(BackingError::OutOfRange {
                offset: pa,
                len: usize::try_from(size).unwrap_or(usize::MAX),
                size: backing_size,
            }
            .into());
        }

        let (first, count) = page_span(va, size);
        for i in 0..count {
            self.page_table
                .store(first + i, Pte::new(pa + (i << PAGE_BITS)));
        }
        trace!(va, pa, size, "map");

        self.tracking.notify_map(va, size);
        Ok(())
    }

    /// Unmaps `size` bytes at `va`. Both must be page-aligned.
    pub fn unmap(&self, va: u64, size: u64) -> Result<()> {
        debug_assert_eq!(va & PAGE_MASK, 0, "unaligned va 0x{va:x}");
        debug_assert_eq!(size & PAGE_MASK, 0, "unaligned size 0x{size:x}");

        if !self.validate_range(va, size) {
            return Err(VmemError::InvalidMemoryRegion { va, size });
        }

        let (first, count) = page_span(va, size);
        for i in 0..count {
            self.page_table.store(first + i, Pte::UNMAPPED);
        }
        trace!(va, size, "unmap");

        self.tracking.notify_unmap(va, size);
        Ok(())
    }

    /// Whether `va` lies inside the address space. Says nothing about mapping state.
    #[inline]
    pub fn validate_address(&self, va: u64) -> bool {
        va < self.address_space_size
    }

    /// Whether `[va, va + size)` lies inside the address space without overflowing.
    #[inline]
    pub fn validate_range(&self, va: u64, size: u64) -> bool {
        va.checked_add(size)
            .is_some_and(|end| end <= self.address_space_size)
    }

    /// Raw page table entry for the page containing `va`.
    #[inline]
    pub fn pte(&self, va: u64) -> Pte {
        self.page_table.load(va >> PAGE_BITS)
    }

    #[inline]
    pub fn is_mapped(&self, va: u64) -> bool {
        self.validate_address(va) && self.pte(va).is_mapped()
    }

    /// Whether every page overlapping `[va, va + size)` is valid and mapped. Empty ranges are.
    pub fn is_range_mapped(&self, va: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        if !self.validate_range(va, size) {
            return false;
        }
        let (first, count) = page_span(va, size);
        (first..first + count).all(|page| self.page_table.load(page).is_mapped())
    }

    /// Backing store offset of `va`, or `None` if it is outside the address space or unmapped.
    #[inline]
    pub fn translate(&self, va: u64) -> Option<u64> {
        if !self.validate_address(va) {
            return None;
        }
        let pte = self.pte(va);
        pte.is_mapped().then(|| pte.frame() + (va & PAGE_MASK))
    }

    /// Translation without validity checks, for paths that already validated the range.
    #[inline]
    pub(crate) fn translate_internal(&self, va: u64) -> u64 {
        self.pte(va).frame() + (va & PAGE_MASK)
    }

    pub(crate) fn check_range_mapped(&self, va: u64, size: u64) -> Result<()> {
        if self.is_range_mapped(va, size) {
            Ok(())
        } else {
            Err(VmemError::InvalidMemoryRegion { va, size })
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn page_span_counts_partial_pages() {
        assert_eq!(page_span(0, 0), (0, 0));
        assert_eq!(page_span(0, 1), (0, 1));
        assert_eq!(page_span(0, PAGE_SIZE), (0, 1));
        assert_eq!(page_span(PAGE_SIZE - 1, 2), (0, 2));
        assert_eq!(page_span(0x1800, 0x2000), (1, 3));
        assert_eq!(page_span(u64::MAX, 16), (u64::MAX >> PAGE_BITS, 1));
    }
}
