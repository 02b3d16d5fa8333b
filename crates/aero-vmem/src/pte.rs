//! Page table entry encoding.
//!
//! A PTE is a single `u64`:
//!
//! ```text
//!  63            48 47                              12 11        1   0
//! +----------------+----------------------------------+-----------+---+
//! |      tag       |     physical frame offset        |  (zero)   | P |
//! +----------------+----------------------------------+-----------+---+
//! ```
//!
//! - The frame field is the page-aligned byte offset into the backing store.
//! - `P` marks the entry as mapped, so a frame at offset 0 is still distinguishable from an empty
//!   entry. An entry is mapped iff its low 48 bits are nonzero.
//! - The tag holds the software guard state. Bit 48 guards reads, bit 49 guards writes. A cleared
//!   tag means "fully accessible, nothing armed".

use bitflags::bitflags;

use crate::PAGE_SIZE;

/// First bit of the tag field.
pub const PTE_TAG_SHIFT: u32 = 48;

/// Low bits holding the physical offset (and the present marker).
pub const PTE_ADDRESS_MASK: u64 = (1 << PTE_TAG_SHIFT) - 1;

/// High 16 bits holding the guard tag.
pub const PTE_TAG_MASK: u64 = !PTE_ADDRESS_MASK;

/// Page-aligned part of the address field.
pub const PTE_FRAME_MASK: u64 = PTE_ADDRESS_MASK & !(PAGE_SIZE - 1);

/// Present marker, stored in the (otherwise unused) page offset bits.
pub const PTE_PRESENT: u64 = 1;

/// Tag bit armed when reads of the page must be reported.
pub const PTE_GUARD_READ: u64 = 1 << PTE_TAG_SHIFT;

/// Tag bit armed when writes to the page must be reported.
pub const PTE_GUARD_WRITE: u64 = 1 << (PTE_TAG_SHIFT + 1);

/// Largest backing store offset representable in a PTE.
pub const MAX_PHYSICAL_ADDRESS: u64 = PTE_ADDRESS_MASK;

bitflags! {
    /// Access permitted to a guest page by the software guard emulation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Carried through for callers that hold full guest page permissions. Instruction fetches
        /// go through the read path, so the guard tag ignores this bit.
        const EXECUTE = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MemoryPermission {
    /// Tag value stored for this permission: the inverse of the read/write bits, so that the
    /// fully open state is `0`.
    #[inline]
    pub const fn guard_tag(self) -> u16 {
        MemoryPermission::READ_WRITE.difference(self).bits() as u16
    }
}

/// Tag bits that must be clear for an access of the given kind to go unreported.
///
/// Every write implies a read, so writes check both guards.
#[inline]
pub const fn guard_check_mask(write: bool) -> u64 {
    if write {
        PTE_GUARD_READ | PTE_GUARD_WRITE
    } else {
        PTE_GUARD_READ
    }
}

/// A page table entry value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Pte(u64);

const _: () = assert!(core::mem::size_of::<Pte>() == crate::PTE_SIZE);

impl Pte {
    pub const UNMAPPED: Pte = Pte(0);

    /// Entry mapping the page frame at backing store offset `pa`, with no guards armed.
    #[inline]
    pub const fn new(pa: u64) -> Self {
        debug_assert!(pa & (PAGE_SIZE - 1) == 0);
        debug_assert!(pa <= MAX_PHYSICAL_ADDRESS);
        Pte((pa & PTE_FRAME_MASK) | PTE_PRESENT)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_mapped(self) -> bool {
        self.0 & PTE_ADDRESS_MASK != 0
    }

    /// Backing store offset of the page frame.
    #[inline]
    pub const fn frame(self) -> u64 {
        self.0 & PTE_FRAME_MASK
    }

    #[inline]
    pub const fn tag(self) -> u16 {
        (self.0 >> PTE_TAG_SHIFT) as u16
    }

    /// Same entry with the tag field replaced.
    #[inline]
    pub const fn with_tag(self, tag: u16) -> Self {
        Pte((self.0 & PTE_ADDRESS_MASK) | ((tag as u64) << PTE_TAG_SHIFT))
    }

    /// Same entry with the given tag bits cleared. Address bits are never touched.
    #[inline]
    pub const fn without_bits(self, mask: u64) -> Self {
        Pte(self.0 & !(mask & PTE_TAG_MASK))
    }

    /// Whether any of the guard bits in `mask` are armed.
    #[inline]
    pub const fn is_armed(self, mask: u64) -> bool {
        self.0 & mask != 0
    }
}
