//! Scatter/gather access to guest virtual memory.
//!
//! Every access first resolves its range against the page table. Ranges whose pages map to one
//! unbroken physical run take a single backing store copy (or a direct view); anything else is
//! split at page boundaries and each piece is translated on its own.

use std::borrow::Cow;
use std::ops::{Deref, DerefMut};

use bytemuck::Pod;
use tracing::warn;

use crate::address_space::{page_span, AddressSpace};
use crate::backing::BackingStore;
use crate::error::{Result, VmemError};
use crate::tracking::TrackingEngine;
use crate::{PAGE_MASK, PAGE_SIZE};

/// A run of backing store bytes, as returned by
/// [`AddressSpace::get_physical_regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegion {
    pub offset: u64,
    pub size: u64,
}

impl<B: BackingStore, E: TrackingEngine> AddressSpace<B, E> {
    /// Whether `[va, va + size)` is mapped onto one unbroken run of the backing store.
    pub fn is_contiguous(&self, va: u64, size: u64) -> bool {
        if size == 0 {
            return self.is_mapped(va);
        }
        if !self.validate_range(va, size) {
            return false;
        }

        let (first, count) = page_span(va, size);
        let mut expected = None;
        for page in first..first + count {
            let pte = self.page_table.load(page);
            if !pte.is_mapped() {
                return false;
            }
            if expected.is_some_and(|frame| frame != pte.frame()) {
                return false;
            }
            expected = Some(pte.frame() + PAGE_SIZE);
        }
        true
    }

    /// The backing store runs covering `[va, va + size)`, in address order, with physically
    /// adjacent pages coalesced. `None` if any part of the range is invalid or unmapped.
    pub fn get_physical_regions(&self, va: u64, size: u64) -> Option<Vec<PhysicalRegion>> {
        if size == 0 {
            return Some(Vec::new());
        }
        if !self.validate_range(va, size) {
            return None;
        }

        let mut regions: Vec<PhysicalRegion> = Vec::new();
        self.walk(va, size, |pa, _, len| {
            match regions.last_mut() {
                Some(last) if last.offset + last.size == pa => last.size += len,
                _ => regions.push(PhysicalRegion {
                    offset: pa,
                    size: len,
                }),
            }
            Ok(())
        })
        .ok()?;
        Some(regions)
    }

    /// Copies guest memory at `va` into `dst`.
    pub fn read(&self, va: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let size = dst.len() as u64;
        self.check_range_mapped(va, size)?;
        if self.track_reads {
            self.mark_region_as_modified(va, size, false);
        }
        self.read_impl(va, dst)
    }

    /// Like [`read`](Self::read), but always reports the access to read guards.
    pub fn read_tracked(&self, va: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let size = dst.len() as u64;
        self.check_range_mapped(va, size)?;
        self.mark_region_as_modified(va, size, false);
        self.read_impl(va, dst)
    }

    pub fn read_vec(&self, va: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read(va, &mut buf)?;
        Ok(buf)
    }

    pub fn read_value<T: Pod>(&self, va: u64) -> Result<T> {
        let mut value = T::zeroed();
        self.read(va, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Guest memory at `va` as bytes: borrowed straight from the backing store when the range is
    /// physically contiguous, gathered into a new buffer otherwise.
    pub fn get_span(&mut self, va: u64, size: usize) -> Result<Cow<'_, [u8]>> {
        if size == 0 {
            return Ok(Cow::Borrowed(&[][..]));
        }
        let size_u64 = size as u64;
        self.check_range_mapped(va, size_u64)?;
        if self.track_reads {
            self.mark_region_as_modified(va, size_u64, false);
        }

        if let Some(pa) = self.direct_offset(va, size) {
            let bytes = self
                .backing
                .get_slice(pa, size)
                .ok_or(VmemError::DirectAccessUnsupported { va, size: size_u64 })?;
            return Ok(Cow::Borrowed(bytes));
        }

        let mut buf = vec![0u8; size];
        self.read_impl(va, &mut buf)?;
        Ok(Cow::Owned(buf))
    }

    /// Copies `data` into guest memory at `va`, reporting the write to armed guards first.
    pub fn write(&self, va: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        self.check_range_mapped(va, size)?;
        self.mark_region_as_modified(va, size, true);
        self.write_impl(va, data)
    }

    /// Copies `data` into guest memory without consulting the guards.
    ///
    /// For loaders and restores whose writes must not invalidate anything.
    pub fn write_untracked(&self, va: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range_mapped(va, data.len() as u64)?;
        self.write_impl(va, data)
    }

    pub fn write_value<T: Pod>(&self, va: u64, value: &T) -> Result<()> {
        self.write(va, bytemuck::bytes_of(value))
    }

    /// Sets `size` bytes at `va` to `value`.
    pub fn fill(&self, va: u64, size: u64, value: u8) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.check_range_mapped(va, size)?;
        self.mark_region_as_modified(va, size, true);

        let pattern = [value; PAGE_SIZE as usize];
        self.walk(va, size, |pa, _, len| {
            self.backing.write_from(pa, &pattern[..len as usize])?;
            Ok(())
        })
    }

    /// Exclusive reference to a `T` living in guest memory at `va`.
    ///
    /// The whole of `T` must sit in one physical run; a fragmented range is a caller error and
    /// fails with [`VmemError::NotContiguous`]. The region is reported as written before the
    /// reference is handed out. Nothing re-checks guards while the reference is used.
    pub fn get_mutable_reference<T: Pod>(&mut self, va: u64) -> Result<&mut T> {
        let size = core::mem::size_of::<T>() as u64;
        // A zero-sized `T` still needs a mapped `va` to point into.
        if !self.is_mapped(va) {
            return Err(VmemError::InvalidMemoryRegion { va, size });
        }
        self.check_range_mapped(va, size)?;
        if size != 0 && !self.is_contiguous(va, size) {
            return Err(VmemError::NotContiguous { va, size });
        }
        self.mark_region_as_modified(va, size, true);

        let pa = self.translate_internal(va);
        let bytes = self
            .backing
            .get_slice_mut(pa, size as usize)
            .ok_or(VmemError::DirectAccessUnsupported { va, size })?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| VmemError::Misaligned {
            va,
            align: core::mem::align_of::<T>(),
        })
    }

    /// Mutable bytes for `[va, va + size)`.
    ///
    /// Contiguous ranges borrow the backing store directly. Fragmented ranges are copied into a
    /// buffer that is written back when the region is dropped. With `tracked` set the range is
    /// reported as written up front, and the write-back is tracked as well.
    pub fn get_writable_region(
        &mut self,
        va: u64,
        size: usize,
        tracked: bool,
    ) -> Result<WritableRegion<'_, B, E>> {
        if size == 0 {
            return Ok(WritableRegion {
                inner: Writable::Direct(Default::default()),
            });
        }
        let size_u64 = size as u64;
        self.check_range_mapped(va, size_u64)?;
        if tracked {
            self.mark_region_as_modified(va, size_u64, true);
        }

        if let Some(pa) = self.direct_offset(va, size) {
            let bytes = self
                .backing
                .get_slice_mut(pa, size)
                .ok_or(VmemError::DirectAccessUnsupported { va, size: size_u64 })?;
            return Ok(WritableRegion {
                inner: Writable::Direct(bytes),
            });
        }

        let mut data = vec![0u8; size];
        self.read_impl(va, &mut data)?;
        Ok(WritableRegion {
            inner: Writable::Copied {
                space: &*self,
                va,
                tracked,
                data,
            },
        })
    }

    /// Backing store offset of `va` if the range is contiguous and the store offers direct views.
    fn direct_offset(&mut self, va: u64, size: usize) -> Option<u64> {
        if !self.is_contiguous(va, size as u64) {
            return None;
        }
        let pa = self.translate_internal(va);
        self.backing.get_slice(pa, size).is_some().then_some(pa)
    }

    fn read_impl(&self, va: u64, dst: &mut [u8]) -> Result<()> {
        let size = dst.len() as u64;
        if self.is_contiguous(va, size) {
            self.backing.read_into(self.translate_internal(va), dst)?;
            return Ok(());
        }
        self.walk(va, size, |pa, offset, len| {
            let start = offset as usize;
            self.backing
                .read_into(pa, &mut dst[start..start + len as usize])?;
            Ok(())
        })
    }

    fn write_impl(&self, va: u64, src: &[u8]) -> Result<()> {
        let size = src.len() as u64;
        if self.is_contiguous(va, size) {
            self.backing.write_from(self.translate_internal(va), src)?;
            return Ok(());
        }
        self.walk(va, size, |pa, offset, len| {
            let start = offset as usize;
            self.backing.write_from(pa, &src[start..start + len as usize])?;
            Ok(())
        })
    }

    /// Calls `f(pa, offset, len)` for each page-bounded piece of `[va, va + size)`: a leading
    /// partial page, whole pages, then a trailing partial page. `offset` is relative to `va`.
    fn walk<F>(&self, va: u64, size: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, u64, u64) -> Result<()>,
    {
        let mut offset = 0u64;
        while offset < size {
            let cur = va + offset;
            let pte = self.pte(cur);
            if !self.validate_address(cur) || !pte.is_mapped() {
                return Err(VmemError::InvalidMemoryRegion { va, size });
            }
            let in_page = cur & PAGE_MASK;
            let len = (PAGE_SIZE - in_page).min(size - offset);
            f(pte.frame() + in_page, offset, len)?;
            offset += len;
        }
        Ok(())
    }
}

/// Mutable view of guest memory returned by [`AddressSpace::get_writable_region`].
pub struct WritableRegion<'a, B: BackingStore, E: TrackingEngine> {
    inner: Writable<'a, B, E>,
}

enum Writable<'a, B: BackingStore, E: TrackingEngine> {
    Direct(&'a mut [u8]),
    Copied {
        space: &'a AddressSpace<B, E>,
        va: u64,
        tracked: bool,
        data: Vec<u8>,
    },
}

impl<B: BackingStore, E: TrackingEngine> WritableRegion<'_, B, E> {
    /// Whether the bytes alias the backing store (no write-back on drop).
    pub fn is_direct(&self) -> bool {
        matches!(self.inner, Writable::Direct(_))
    }
}

impl<B: BackingStore, E: TrackingEngine> Deref for WritableRegion<'_, B, E> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            Writable::Direct(bytes) => bytes,
            Writable::Copied { data, .. } => data,
        }
    }
}

impl<B: BackingStore, E: TrackingEngine> DerefMut for WritableRegion<'_, B, E> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.inner {
            Writable::Direct(bytes) => bytes,
            Writable::Copied { data, .. } => data,
        }
    }
}

impl<B: BackingStore, E: TrackingEngine> Drop for WritableRegion<'_, B, E> {
    fn drop(&mut self) {
        let Writable::Copied {
            space,
            va,
            tracked,
            data,
        } = &self.inner
        else {
            return;
        };

        let result = if *tracked {
            space.write(*va, data)
        } else {
            space.write_untracked(*va, data)
        };
        if let Err(err) = result {
            warn!(va = *va, size = data.len(), %err, "failed to write back guest memory region");
        }
    }
}
