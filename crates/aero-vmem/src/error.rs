use thiserror::Error;

use crate::backing::BackingError;

pub type Result<T> = std::result::Result<T, VmemError>;

/// Errors returned by [`AddressSpace`](crate::AddressSpace) operations.
///
/// Translation and mapping predicates never produce these; they answer with `None`/`false`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmemError {
    /// Part of the range is outside the address space or not mapped.
    #[error("invalid memory region: va=0x{va:x} size=0x{size:x}")]
    InvalidMemoryRegion { va: u64, size: u64 },

    /// The caller required a single physical run but the range is fragmented. This is a caller
    /// logic error, not a data availability problem.
    #[error("memory not contiguous: va=0x{va:x} size=0x{size:x}")]
    NotContiguous { va: u64, size: u64 },

    /// A typed reference would land on a host address without the required alignment.
    #[error("misaligned reference: va=0x{va:x} align={align}")]
    Misaligned { va: u64, align: usize },

    /// The backing store does not hand out direct views.
    #[error("backing store has no direct access for va=0x{va:x} size=0x{size:x}")]
    DirectAccessUnsupported { va: u64, size: u64 },

    /// The physical target of a mapping does not fit in a page table entry.
    #[error("physical range not representable: pa=0x{pa:x} size=0x{size:x}")]
    PhysicalOutOfRange { pa: u64, size: u64 },

    /// The requested address space needs more pages than the host can index.
    #[error("address space of {size} bytes is too large")]
    AddressSpaceTooLarge { size: u64 },

    #[error(transparent)]
    Backing(#[from] BackingError),
}
