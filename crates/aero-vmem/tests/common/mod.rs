#![allow(dead_code)]

use std::sync::Mutex;

use aero_vmem::tracking::{TrackedGranularRegion, TrackedRegion, TrackingEngine};
use aero_vmem::{
    AddressSpace, AddressSpaceOptions, BackingResult, BackingStore, GuardProtector, HostMemory,
    MemoryPermission, PAGE_SIZE,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Map { va: u64, size: u64 },
    Unmap { va: u64, size: u64 },
    Touched { va: u64, size: u64, write: bool },
}

/// Engine that records every event and arms freshly mapped pages for writes.
pub struct RecordingEngine {
    protector: GuardProtector,
    events: Mutex<Vec<Event>>,
}

impl RecordingEngine {
    pub fn new(protector: GuardProtector) -> Self {
        Self {
            protector,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn touched(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Touched { .. }))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl TrackingEngine for RecordingEngine {
    type Region = NullRegion;
    type GranularRegion = NullRegion;

    fn notify_map(&self, va: u64, size: u64) {
        self.record(Event::Map { va, size });
        self.protector.reprotect(va, size, MemoryPermission::READ);
    }

    fn notify_unmap(&self, va: u64, size: u64) {
        self.record(Event::Unmap { va, size });
    }

    fn notify_virtual_memory_touched(&self, va: u64, size: u64, write: bool) {
        self.record(Event::Touched { va, size, write });
    }

    fn acquire_region(&self, va: u64, size: u64) -> NullRegion {
        NullRegion { va, size }
    }

    fn acquire_granular(&self, va: u64, size: u64, _granularity: u64) -> NullRegion {
        NullRegion { va, size }
    }
}

pub struct NullRegion {
    va: u64,
    size: u64,
}

impl TrackedRegion for NullRegion {
    fn address(&self) -> u64 {
        self.va
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn dirty(&self) -> bool {
        false
    }

    fn force_dirty(&self) {}

    fn reprotect(&self) {}

    fn release(&mut self) {}
}

impl TrackedGranularRegion for NullRegion {
    fn address(&self) -> u64 {
        self.va
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn granularity(&self) -> u64 {
        PAGE_SIZE
    }

    fn is_range_modified(&self, _va: u64, _size: u64) -> bool {
        false
    }

    fn query_modified(&self, _va: u64, _size: u64, _f: &mut dyn FnMut(u64, u64)) {}

    fn force_dirty(&self, _va: u64, _size: u64) {}

    fn release(&mut self) {}
}

pub type RecordingSpace = AddressSpace<HostMemory, RecordingEngine>;

/// Address space of `size` bytes over a backing store of `backing_size` bytes.
pub fn recording_space(size: u64, backing_size: u64) -> RecordingSpace {
    init_tracing();
    AddressSpace::with_tracking(
        HostMemory::new(backing_size).unwrap(),
        AddressSpaceOptions::new(size),
        RecordingEngine::new,
    )
    .unwrap()
}

/// Backing store that only supports copies, like a store shared with another thread or process.
pub struct CopyOnlyMemory(HostMemory);

impl CopyOnlyMemory {
    pub fn new(size: u64) -> Self {
        Self(HostMemory::new(size).unwrap())
    }
}

impl BackingStore for CopyOnlyMemory {
    fn size(&self) -> u64 {
        self.0.size()
    }

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> BackingResult<()> {
        self.0.read_into(offset, dst)
    }

    fn write_from(&self, offset: u64, src: &[u8]) -> BackingResult<()> {
        self.0.write_from(offset, src)
    }
}

pub fn copy_only_space(size: u64) -> AddressSpace<CopyOnlyMemory, RecordingEngine> {
    init_tracing();
    AddressSpace::with_tracking(
        CopyOnlyMemory::new(size),
        AddressSpaceOptions::new(size),
        RecordingEngine::new,
    )
    .unwrap()
}
