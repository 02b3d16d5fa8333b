//! Memory tracking: the engine contract and the handles consumers hold.
//!
//! The address space produces events (map, unmap, guarded access) and brokers handle acquisition;
//! what gets invalidated in response is the engine's business. [`RegionTracker`] is the
//! engine used by default.
//!
//! [`RegionTracker`]: region_tracker::RegionTracker

pub mod region_tracker;

use crate::address_space::AddressSpace;
use crate::backing::BackingStore;

/// Receiver of address space events and factory for tracking handles.
pub trait TrackingEngine: Send + Sync {
    type Region: TrackedRegion;
    type GranularRegion: TrackedGranularRegion;

    /// `[va, va + size)` was mapped (or remapped). Guards in the range are open.
    fn notify_map(&self, va: u64, size: u64);

    /// `[va, va + size)` was unmapped.
    fn notify_unmap(&self, va: u64, size: u64);

    /// An access consumed an armed guard somewhere in `[va, va + size)`. Called before the access
    /// moves any bytes.
    fn notify_virtual_memory_touched(&self, va: u64, size: u64, write: bool);

    fn acquire_region(&self, va: u64, size: u64) -> Self::Region;

    fn acquire_granular(&self, va: u64, size: u64, granularity: u64) -> Self::GranularRegion;
}

/// Engine-side state of a single-region handle.
pub trait TrackedRegion: Send + Sync {
    fn address(&self) -> u64;

    fn size(&self) -> u64;

    /// Whether the region was touched since the last [`reprotect`](Self::reprotect).
    fn dirty(&self) -> bool;

    fn force_dirty(&self);

    /// Clears the dirty state and re-arms the guards over the region.
    fn reprotect(&self);

    /// Stops tracking. Called exactly once.
    fn release(&mut self);
}

/// Engine-side state of a handle split into equal granules.
pub trait TrackedGranularRegion: Send + Sync {
    fn address(&self) -> u64;

    fn size(&self) -> u64;

    fn granularity(&self) -> u64;

    /// Whether any granule overlapping `[va, va + size)` was touched since it was last queried.
    fn is_range_modified(&self, va: u64, size: u64) -> bool;

    /// Calls `f(va, size)` for each run of touched granules overlapping `[va, va + size)`, then
    /// clears and re-arms them.
    fn query_modified(&self, va: u64, size: u64, f: &mut dyn FnMut(u64, u64));

    fn force_dirty(&self, va: u64, size: u64);

    /// Stops tracking. Called exactly once.
    fn release(&mut self);
}

/// A tracked contiguous range of guest memory.
///
/// Released when dropped or when [`release`](Self::release) is called, whichever comes first.
pub struct RegionHandle<R: TrackedRegion> {
    inner: R,
    released: bool,
}

impl<R: TrackedRegion> RegionHandle<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    pub fn address(&self) -> u64 {
        self.inner.address()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty()
    }

    pub fn force_dirty(&self) {
        self.inner.force_dirty();
    }

    /// Marks the region clean and arms its guards again.
    ///
    /// Call before re-reading guest memory: writes that land after this point are reported, and
    /// writes that landed before it are picked up by the read.
    pub fn reprotect(&self) {
        self.inner.reprotect();
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release();
        }
    }
}

impl<R: TrackedRegion> Drop for RegionHandle<R> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// A tracked range of guest memory split into `granularity`-sized units.
///
/// Released when dropped or when [`release`](Self::release) is called, whichever comes first.
pub struct GranularRegionHandle<G: TrackedGranularRegion> {
    inner: G,
    released: bool,
}

impl<G: TrackedGranularRegion> GranularRegionHandle<G> {
    fn new(inner: G) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    pub fn address(&self) -> u64 {
        self.inner.address()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn granularity(&self) -> u64 {
        self.inner.granularity()
    }

    pub fn is_range_modified(&self, va: u64, size: u64) -> bool {
        self.inner.is_range_modified(va, size)
    }

    /// Runs `f` over every modified run in `[va, va + size)` and re-arms those granules.
    pub fn query_modified(&self, va: u64, size: u64, mut f: impl FnMut(u64, u64)) {
        self.inner.query_modified(va, size, &mut f);
    }

    pub fn force_dirty(&self, va: u64, size: u64) {
        self.inner.force_dirty(va, size);
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release();
        }
    }
}

impl<G: TrackedGranularRegion> Drop for GranularRegionHandle<G> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<B: BackingStore, E: TrackingEngine> AddressSpace<B, E> {
    /// Starts tracking `[va, va + size)` as a single region.
    pub fn begin_tracking(&self, va: u64, size: u64) -> RegionHandle<E::Region> {
        RegionHandle::new(self.tracking().acquire_region(va, size))
    }

    /// Starts tracking `[va, va + size)` in `granularity`-sized units.
    pub fn begin_granular_tracking(
        &self,
        va: u64,
        size: u64,
        granularity: u64,
    ) -> GranularRegionHandle<E::GranularRegion> {
        GranularRegionHandle::new(self.tracking().acquire_granular(va, size, granularity))
    }
}
