//! Guest virtual memory on top of a single contiguous host backing store.
//!
//! An [`AddressSpace`] owns a flat page table that maps guest virtual pages onto byte offsets in a
//! [`BackingStore`]. Every page table entry also carries a 16-bit tag that the software guard-page
//! emulator uses to notice the first write (or read) to a page after it was armed, so that code
//! caches and GPU resource caches can be told which guest memory changed.
//!
//! - [`pte`]: the tagged page table entry encoding.
//! - [`AddressSpace`]: map/unmap, translation and the bulk access paths.
//! - [`GuardProtector`]: lock-free arming/disarming of per-page guards.
//! - [`tracking`]: the tracking engine contract and the handles consumers hold.
//!
//! Protection is advisory: it only affects the access paths in this crate, never the host MMU.

mod access;
mod address_space;
mod backing;
mod error;
mod guard;
mod options;
mod page_table;
pub mod pte;
pub mod tracking;

pub use access::{PhysicalRegion, WritableRegion};
pub use address_space::AddressSpace;
pub use backing::{BackingError, BackingResult, BackingStore, HostMemory};
pub use error::{Result, VmemError};
pub use guard::GuardProtector;
pub use options::AddressSpaceOptions;
pub use pte::{MemoryPermission, Pte};
pub use tracking::region_tracker::RegionTracker;
pub use tracking::{GranularRegionHandle, RegionHandle, TrackingEngine};

/// Number of bits in a guest page offset.
pub const PAGE_BITS: u32 = 12;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Mask selecting the offset within a page.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Size of one page table entry in bytes.
pub const PTE_SIZE: usize = 8;
