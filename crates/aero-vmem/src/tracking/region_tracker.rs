//! Default tracking engine: per-handle dirty flags kept in sync with the page guards.
//!
//! A page is armed for writes (`MemoryPermission::READ`) while at least one live, clean granule
//! overlaps it, and open otherwise. Consumers poll their handles; the engine never decides what
//! to invalidate.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::guard::GuardProtector;
use crate::pte::MemoryPermission;
use crate::tracking::{TrackedGranularRegion, TrackedRegion, TrackingEngine};
use crate::{PAGE_MASK, PAGE_SIZE};

struct TrackedRange {
    id: u64,
    va: u64,
    size: u64,
    granularity: u64,
    dirty: Box<[AtomicBool]>,
}

impl TrackedRange {
    fn new(id: u64, va: u64, size: u64, granularity: u64) -> Self {
        let granularity = if granularity == 0 {
            size.max(1)
        } else {
            granularity
        };
        let granules = usize::try_from(size.div_ceil(granularity)).unwrap_or(usize::MAX);
        Self {
            id,
            va,
            size,
            granularity,
            // Nothing has been synchronized yet.
            dirty: (0..granules).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    #[inline]
    fn end(&self) -> u64 {
        self.va.saturating_add(self.size)
    }

    /// Indices of the granules overlapping `[va, va + size)`.
    fn granules(&self, va: u64, size: u64) -> Range<usize> {
        let start = va.max(self.va);
        let end = va.saturating_add(size).min(self.end());
        if start >= end {
            return 0..0;
        }
        let first = (start - self.va) / self.granularity;
        let last = (end - 1 - self.va) / self.granularity;
        first as usize..(last as usize + 1).min(self.dirty.len())
    }

    /// Guest range covered by granules `indices`.
    fn bounds(&self, indices: &Range<usize>) -> (u64, u64) {
        let offset = |index: usize| {
            self.va
                .saturating_add((index as u64).saturating_mul(self.granularity))
                .min(self.end())
        };
        let start = offset(indices.start);
        let end = offset(indices.end);
        (start, end.saturating_sub(start))
    }

    fn any_clean(&self, va: u64, size: u64) -> bool {
        self.granules(va, size)
            .any(|i| !self.dirty[i].load(Ordering::SeqCst))
    }

    fn any_dirty(&self, va: u64, size: u64) -> bool {
        self.granules(va, size)
            .any(|i| self.dirty[i].load(Ordering::SeqCst))
    }

    fn set_dirty(&self, indices: Range<usize>, dirty: bool) {
        for i in indices {
            self.dirty[i].store(dirty, Ordering::SeqCst);
        }
    }
}

struct Shared {
    protector: GuardProtector,
    ranges: Mutex<Vec<Arc<TrackedRange>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<TrackedRange>>> {
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new range, clamped to the address space.
    fn register(&self, va: u64, size: u64, granularity: u64) -> Arc<TrackedRange> {
        let limit = self.protector.address_space_size();
        let va = va.min(limit);
        let size = size.min(limit - va);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let range = Arc::new(TrackedRange::new(id, va, size, granularity));
        self.lock().push(range.clone());
        trace!(id, va, size, granularity, "begin tracking");
        range
    }

    fn unregister(&self, range: &TrackedRange) {
        let mut ranges = self.lock();
        ranges.retain(|r| r.id != range.id);
        self.refresh_protection(&ranges, range.va, range.size);
        trace!(id = range.id, "end tracking");
    }

    /// Re-derives the guard of every page in `[va, va + size)` from the live granules.
    fn refresh_protection(&self, ranges: &[Arc<TrackedRange>], va: u64, size: u64) {
        if size == 0 {
            return;
        }
        let end = va
            .saturating_add(size)
            .min(self.protector.address_space_size());
        let mut page = va & !PAGE_MASK;
        while page < end {
            let armed = ranges.iter().any(|r| r.any_clean(page, PAGE_SIZE));
            let permission = if armed {
                MemoryPermission::READ
            } else {
                MemoryPermission::READ_WRITE
            };
            self.protector.reprotect(page, PAGE_SIZE, permission);

            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
    }

    /// Marks every granule overlapping `[va, va + size)` dirty and updates the affected guards.
    fn mark_dirty(&self, va: u64, size: u64, refresh: bool) {
        let ranges = self.lock();
        let mut touched = Vec::new();
        for range in ranges.iter() {
            let indices = range.granules(va, size);
            if indices.is_empty() {
                continue;
            }
            touched.push(range.bounds(&indices));
            range.set_dirty(indices, true);
        }
        if refresh {
            for (va, size) in touched {
                self.refresh_protection(&ranges, va, size);
            }
        }
    }

    /// Marks the granules overlapping `[va, va + size)` clean and arms their pages.
    fn mark_clean(&self, range: &TrackedRange, va: u64, size: u64) {
        let ranges = self.lock();
        let indices = range.granules(va, size);
        if indices.is_empty() {
            return;
        }
        let (va, size) = range.bounds(&indices);
        range.set_dirty(indices, false);
        self.refresh_protection(&ranges, va, size);
    }
}

/// The default [`TrackingEngine`].
///
/// Handle ranges are clamped to the address space when acquired; `address()` and `size()` report
/// the clamped range.
#[derive(Clone)]
pub struct RegionTracker {
    shared: Arc<Shared>,
}

impl RegionTracker {
    pub fn new(protector: GuardProtector) -> Self {
        Self {
            shared: Arc::new(Shared {
                protector,
                ranges: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of live handles.
    pub fn tracked_count(&self) -> usize {
        self.shared.lock().len()
    }
}

impl TrackingEngine for RegionTracker {
    type Region = TrackerRegion;
    type GranularRegion = TrackerGranularRegion;

    fn notify_map(&self, va: u64, size: u64) {
        self.shared.mark_dirty(va, size, true);
    }

    fn notify_unmap(&self, va: u64, size: u64) {
        // Unmapped pages carry no guards, so there is nothing to re-protect.
        self.shared.mark_dirty(va, size, false);
    }

    fn notify_virtual_memory_touched(&self, va: u64, size: u64, write: bool) {
        // Handles only track modifications; read guards are never armed by this engine.
        if write {
            trace!(va, size, "region modified");
            self.shared.mark_dirty(va, size, true);
        }
    }

    fn acquire_region(&self, va: u64, size: u64) -> TrackerRegion {
        TrackerRegion {
            // A single region is one granule; zero stands for "whatever size it was clamped to".
            range: self.shared.register(va, size, 0),
            shared: self.shared.clone(),
        }
    }

    fn acquire_granular(&self, va: u64, size: u64, granularity: u64) -> TrackerGranularRegion {
        TrackerGranularRegion {
            range: self.shared.register(va, size, granularity),
            shared: self.shared.clone(),
        }
    }
}

/// [`RegionTracker`] state behind a [`RegionHandle`](crate::RegionHandle).
pub struct TrackerRegion {
    range: Arc<TrackedRange>,
    shared: Arc<Shared>,
}

impl TrackedRegion for TrackerRegion {
    fn address(&self) -> u64 {
        self.range.va
    }

    fn size(&self) -> u64 {
        self.range.size
    }

    fn dirty(&self) -> bool {
        self.range.any_dirty(self.range.va, self.range.size)
    }

    fn force_dirty(&self) {
        self.shared.mark_dirty(self.range.va, self.range.size, true);
    }

    fn reprotect(&self) {
        self.shared
            .mark_clean(&self.range, self.range.va, self.range.size);
    }

    fn release(&mut self) {
        self.shared.unregister(&self.range);
    }
}

/// [`RegionTracker`] state behind a [`GranularRegionHandle`](crate::GranularRegionHandle).
pub struct TrackerGranularRegion {
    range: Arc<TrackedRange>,
    shared: Arc<Shared>,
}

impl TrackedGranularRegion for TrackerGranularRegion {
    fn address(&self) -> u64 {
        self.range.va
    }

    fn size(&self) -> u64 {
        self.range.size
    }

    fn granularity(&self) -> u64 {
        self.range.granularity
    }

    fn is_range_modified(&self, va: u64, size: u64) -> bool {
        self.range.any_dirty(va, size)
    }

    fn query_modified(&self, va: u64, size: u64, f: &mut dyn FnMut(u64, u64)) {
        let mut runs: Vec<Range<usize>> = Vec::new();
        for i in self.range.granules(va, size) {
            if !self.range.dirty[i].load(Ordering::SeqCst) {
                continue;
            }
            match runs.last_mut() {
                Some(run) if run.end == i => run.end = i + 1,
                _ => runs.push(i..i + 1),
            }
        }

        // Re-arm before reporting so writes racing with the consumer's re-read are not lost, and
        // call out without holding the registry lock.
        let bounds: Vec<(u64, u64)> = runs.iter().map(|run| self.range.bounds(run)).collect();
        for &(run_va, run_size) in &bounds {
            self.shared.mark_clean(&self.range, run_va, run_size);
        }
        for (run_va, run_size) in bounds {
            f(run_va, run_size);
        }
    }

    fn force_dirty(&self, va: u64, size: u64) {
        let ranges = self.shared.lock();
        let indices = self.range.granules(va, size);
        if indices.is_empty() {
            return;
        }
        let (va, size) = self.range.bounds(&indices);
        self.range.set_dirty(indices, true);
        self.shared.refresh_protection(&ranges, va, size);
    }

    fn release(&mut self) {
        self.shared.unregister(&self.range);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::pte::guard_check_mask;
    use crate::{AddressSpace, HostMemory};

    const PTE_GUARD_WRITE_CHECK: u64 = guard_check_mask(true);

    fn space(pages: u64) -> AddressSpace<HostMemory> {
        let size = pages * PAGE_SIZE;
        let space = AddressSpace::new(HostMemory::new(size).unwrap(), size).unwrap();
        space.map(0, 0, size).unwrap();
        space
    }

    #[test]
    fn granules_are_clamped_to_the_range() {
        let range = TrackedRange::new(0, 0x1000, 0x2800, 0x1000);
        assert_eq!(range.dirty.len(), 3);
        assert_eq!(range.granules(0, 0x1000), 0..0);
        assert_eq!(range.granules(0x1fff, 2), 0..2);
        assert_eq!(range.granules(0x3000, 0x10000), 2..3);
        assert_eq!(range.bounds(&(2..3)), (0x3000, 0x800));
    }

    #[test]
    fn bounds_saturate_at_the_top_of_the_address_range() {
        let va = u64::MAX - 0xfff;
        let range = TrackedRange::new(0, va, 0x1000, 0x3000);
        let indices = range.granules(va, 0x1000);
        assert_eq!(indices, 0..1);
        assert_eq!(range.bounds(&indices), (va, 0xfff));
    }

    #[test]
    fn zero_granularity_tracks_as_one_unit() {
        let range = TrackedRange::new(0, 0, 0x3000, 0);
        assert_eq!(range.granularity, 0x3000);
        assert_eq!(range.dirty.len(), 1);
    }

    #[test]
    fn handles_start_dirty_and_arm_on_reprotect() {
        let space = space(4);
        let region = space.begin_tracking(0x1000, 0x1000);
        assert!(region.is_dirty());
        assert!(!space.pte(0x1000).is_armed(PTE_GUARD_WRITE_CHECK));

        region.reprotect();
        assert!(!region.is_dirty());
        assert!(space.pte(0x1000).is_armed(PTE_GUARD_WRITE_CHECK));
        assert!(!space.pte(0x2000).is_armed(PTE_GUARD_WRITE_CHECK));

        space.write(0x1010, &[1]).unwrap();
        assert!(region.is_dirty());
        assert!(!space.pte(0x1000).is_armed(PTE_GUARD_WRITE_CHECK));
    }

    #[test]
    fn page_stays_armed_while_a_granule_on_it_is_clean() {
        let space = space(4);
        let a = space.begin_granular_tracking(0, 0x2000, 0x800);
        a.query_modified(0, 0x2000, |_, _| {});

        // A write to the first half of page 0 dirties one granule; the second is still clean.
        space.write(0x10, &[1]).unwrap();
        assert!(a.is_range_modified(0, 0x800));
        assert!(!a.is_range_modified(0x800, 0x800));
        assert!(space.pte(0).is_armed(PTE_GUARD_WRITE_CHECK));
    }

    #[test]
    fn release_opens_guarded_pages() {
        let space = space(2);
        let region = space.begin_tracking(0, 0x1000);
        region.reprotect();
        assert_eq!(space.tracking().tracked_count(), 1);

        region.release();
        assert_eq!(space.tracking().tracked_count(), 0);
        assert!(!space.pte(0).is_armed(PTE_GUARD_WRITE_CHECK));
    }

    #[test]
    fn reads_do_not_dirty() {
        let space = space(2);
        let region = space.begin_tracking(0, 0x2000);
        region.reprotect();
        let mut buf = [0u8; 16];
        space.read_tracked(0, &mut buf).unwrap();
        assert!(!region.is_dirty());
    }

    #[test]
    fn ranges_are_clamped_to_the_address_space() {
        let space = space(4);
        let region = space.begin_tracking(0x2000, 1 << 36);
        assert_eq!(region.address(), 0x2000);
        assert_eq!(region.size(), 0x2000);

        let outside = space.begin_granular_tracking(u64::MAX - 0xfff, 0x1000, 0x3000);
        assert_eq!(outside.address(), 4 * PAGE_SIZE);
        assert_eq!(outside.size(), 0);
        let mut runs = 0;
        outside.query_modified(u64::MAX - 0xfff, 0x1000, |_, _| runs += 1);
        assert_eq!(runs, 0);
    }
}
