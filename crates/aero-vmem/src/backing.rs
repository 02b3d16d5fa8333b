use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Errors returned by [`BackingStore`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackingError {
    #[error("backing store access out of range: offset=0x{offset:x} len={len} size=0x{size:x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    #[error("backing store size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
}

pub type BackingResult<T> = Result<T, BackingError>;

/// The contiguous host buffer guest memory lives in.
///
/// Offsets are byte offsets from the start of the buffer. The copy APIs take `&self` because guest
/// CPU threads and the GPU thread copy in and out of the store concurrently; implementations must
/// make those copies free of data races.
///
/// The slice fast paths take `&mut self`: a Rust reference into memory that another thread may be
/// writing is unsound, so direct views are only handed out while the caller holds the store
/// exclusively. Stores that cannot offer direct views keep the default `None` and callers fall
/// back to the copy APIs.
pub trait BackingStore: Send + Sync {
    fn size(&self) -> u64;

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> BackingResult<()>;

    fn write_from(&self, offset: u64, src: &[u8]) -> BackingResult<()>;

    fn get_slice(&mut self, _offset: u64, _len: usize) -> Option<&[u8]> {
        None
    }

    fn get_slice_mut(&mut self, _offset: u64, _len: usize) -> Option<&mut [u8]> {
        None
    }
}

fn check_range(size: u64, offset: u64, len: usize) -> BackingResult<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(BackingError::OutOfRange { offset, len, size })?;
    if end > size {
        return Err(BackingError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// Heap-allocated backing store.
///
/// Bytes are stored as `AtomicU8` so concurrent copies through `&self` are well defined; two
/// threads writing the same guest byte race the way the guest program asked them to, without
/// undefined behaviour on the host.
#[derive(Debug)]
pub struct HostMemory {
    data: Box<[AtomicU8]>,
}

impl HostMemory {
    pub fn new(size: u64) -> BackingResult<Self> {
        let size_usize = usize::try_from(size).map_err(|_| BackingError::SizeTooLarge { size })?;
        let zeroed = vec![0u8; size_usize].into_boxed_slice();
        // Safety: `AtomicU8` has the same size, alignment and bit validity as `u8`, so a boxed
        // byte slice can be reinterpreted in place. `vec![0; n]` keeps large stores lazily zeroed
        // by the allocator instead of touching every page up front.
        let data = unsafe { Box::from_raw(Box::into_raw(zeroed) as *mut [AtomicU8]) };
        Ok(Self { data })
    }

    #[inline]
    fn range(&self, offset: u64, len: usize) -> BackingResult<core::ops::Range<usize>> {
        check_range(self.size(), offset, len)?;
        // `check_range` bounds the end by `data.len()`, so both ends fit in usize.
        let start = offset as usize;
        Ok(start..start + len)
    }

    #[inline]
    fn bytes_mut(&mut self, range: core::ops::Range<usize>) -> &mut [u8] {
        let atoms = &mut self.data[range];
        // Safety: same layout argument as in `new`; `&mut self` rules out concurrent atomic access
        // for the lifetime of the returned slice.
        unsafe { core::slice::from_raw_parts_mut(atoms.as_mut_ptr().cast::<u8>(), atoms.len()) }
    }
}

impl BackingStore for HostMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> BackingResult<()> {
        let range = self.range(offset, dst.len())?;
        for (slot, byte) in dst.iter_mut().zip(&self.data[range]) {
            *slot = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn write_from(&self, offset: u64, src: &[u8]) -> BackingResult<()> {
        let range = self.range(offset, src.len())?;
        for (byte, value) in self.data[range].iter().zip(src) {
            byte.store(*value, Ordering::Relaxed);
        }
        Ok(())
    }

    fn get_slice(&mut self, offset: u64, len: usize) -> Option<&[u8]> {
        let range = self.range(offset, len).ok()?;
        let bytes: &[u8] = self.bytes_mut(range);
        Some(bytes)
    }

    fn get_slice_mut(&mut self, offset: u64, len: usize) -> Option<&mut [u8]> {
        let range = self.range(offset, len).ok()?;
        Some(self.bytes_mut(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_round_trip() {
        let mem = HostMemory::new(64).unwrap();
        mem.write_from(10, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 6];
        mem.read_into(9, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn slices_observe_copies() {
        let mut mem = HostMemory::new(32).unwrap();
        mem.write_from(0, &[0xaa; 4]).unwrap();
        assert_eq!(mem.get_slice(0, 4).unwrap(), &[0xaa; 4]);

        mem.get_slice_mut(2, 2).unwrap().copy_from_slice(&[0x11, 0x22]);
        let mut buf = [0u8; 4];
        mem.read_into(0, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0x11, 0x22]);
    }

    #[test]
    fn out_of_range_returns_error_without_panicking() {
        let mut mem = HostMemory::new(16).unwrap();
        assert!(matches!(
            mem.read_into(15, &mut [0u8; 2]),
            Err(BackingError::OutOfRange { .. })
        ));
        assert!(matches!(
            mem.write_from(16, &[1u8]),
            Err(BackingError::OutOfRange { .. })
        ));
        assert!(matches!(
            mem.read_into(u64::MAX - 1, &mut [0u8; 2]),
            Err(BackingError::OutOfRange { .. })
        ));
        assert!(mem.get_slice(12, 8).is_none());
        assert!(mem.get_slice_mut(16, 1).is_none());

        // Empty accesses at the very end are in range.
        mem.read_into(16, &mut []).unwrap();
    }
}
