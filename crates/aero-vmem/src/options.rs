use serde::{Deserialize, Serialize};

/// Construction-time configuration of an [`AddressSpace`](crate::AddressSpace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSpaceOptions {
    /// Requested address space size in bytes. Rounded up to a power-of-two number of pages.
    pub size: u64,
    /// Signal read tracking from the plain read paths (`read`, `read_vec`, `read_value`,
    /// `get_span`). When unset only writes and [`read_tracked`] report accesses.
    ///
    /// [`read_tracked`]: crate::AddressSpace::read_tracked
    pub track_reads: bool,
}

impl AddressSpaceOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }
}

impl Default for AddressSpaceOptions {
    fn default() -> Self {
        Self {
            size: 1 << 32,
            track_reads: false,
        }
    }
}
