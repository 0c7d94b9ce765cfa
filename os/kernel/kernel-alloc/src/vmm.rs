//! # User Virtual Memory Manager
//!
//! One [`Vmm`] owns one user page-table tree and mutates it at both
//! granularities:
//!
//! - [`Vmm::grow`] tiles new heap memory with superpages wherever a whole
//!   aligned 2 MiB window fits, and with zeroed 4 KiB pages elsewhere or
//!   when the pool is empty.
//! - [`Vmm::unmap`] / [`Vmm::shrink`] free whole superpages as one unit and
//!   demote a superpage the range only partly covers.
//! - [`Vmm::copy`] / [`Vmm::duplicate`] copy superpages in one pass and
//!   pages one by one.
//! - [`Vmm::resolve_fault`] backs a lazily grown heap page on first touch.
//!
//! Multi-step operations either complete or leave the tree as it was: the
//! range installed so far is tracked by a guard that releases it on the
//! error path.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{Pmm, PhysicalLayout, Vmm};
//! let pmm = unsafe { Pmm::init(mapper, PhysicalLayout::boot(kernel_end)) };
//! let mut vmm = Vmm::create(&pmm)?;
//! let size = vmm.grow(0, 4 << 20, Perm::WRITE)?;
//! ```

use crate::pmm::Pmm;
use core::ptr::copy_nonoverlapping;
use kernel_info::memory::USER_TOP;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, align_up,
    page_round_up,
};
use kernel_vmem::{
    AddressSpace, EntryKind, FrameAlloc, MapError, Perm, PhysMapper, SuperpageAlloc,
};

/// User address space backed by a shared [`Pmm`].
pub struct Vmm<'p, M: PhysMapper> {
    aspace: AddressSpace<'p, M>,
    pmm: &'p Pmm<M>,
}

impl<'p, M: PhysMapper> Vmm<'p, M> {
    /// Empty address space with a fresh root table.
    ///
    /// # Errors
    /// [`VmmError::Map`] if the root table cannot be allocated.
    pub fn create(pmm: &'p Pmm<M>) -> Result<Self, VmmError> {
        let aspace = AddressSpace::create(pmm.mapper(), pmm)?;
        Ok(Self { aspace, pmm })
    }

    #[inline]
    pub const fn address_space(&self) -> &AddressSpace<'p, M> {
        &self.aspace
    }

    #[inline]
    pub const fn pmm(&self) -> &'p Pmm<M> {
        self.pmm
    }

    /// Translate a user address to its physical address and leaf permissions.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Perm)> {
        self.aspace.translate_user(va)
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.aspace.is_mapped(va)
    }

    /// `true` if a superpage leaf maps `va`.
    #[must_use]
    pub fn is_superpage(&self, va: VirtualAddress) -> bool {
        matches!(self.aspace.lookup(va), Some(EntryKind::LargeLeaf(..)))
    }

    /// Grow the heap from `old_size` to `new_size` bytes; neither needs to
    /// be page aligned. New leaves carry `R|U|perm`.
    ///
    /// Returns the new size, or `old_size` if `new_size` is smaller.
    ///
    /// # Errors
    /// Out of memory, or `new_size` beyond the user range. Everything this
    /// call installed is released again; the caller keeps `old_size`.
    pub fn grow(&mut self, old_size: u64, new_size: u64, perm: Perm) -> Result<u64, VmmError> {
        if new_size < old_size {
            return Ok(old_size);
        }
        if new_size > USER_TOP {
            return Err(VmmError::InvalidRange);
        }

        let this = &*self;
        let leaf = Perm::READ | Perm::USER | perm;
        let start = page_round_up::<Size4K>(old_size);
        let mut installed = Installed::new(this, start);

        let mut a = start;
        while a < new_size {
            let boundary = align_up(a, Size2M::SIZE);
            if boundary + Size2M::SIZE <= new_size {
                while a < boundary {
                    this.install_zeroed(VirtualAddress::new(a), leaf)?;
                    a += Size4K::SIZE;
                    installed.extend_to(a);
                }

                if let Some(extent) = this.pmm.alloc_2m() {
                    let va = VirtualAddress::new(a);
                    if let Err(e) = this.aspace.map_large(this.pmm, va, extent, leaf) {
                        this.pmm.free_2m(extent);
                        return Err(e.into());
                    }
                    log::trace!("grow: {va} -> superpage {extent}");
                    a += Size2M::SIZE;
                    installed.extend_to(a);
                    continue;
                }
                log::debug!("grow: superpage pool empty at {a:#x}, using 4 KiB pages");
            }

            this.install_zeroed(VirtualAddress::new(a), leaf)?;
            a += Size4K::SIZE;
            installed.extend_to(a);
        }

        installed.commit();
        log::debug!("grow {old_size:#x} -> {new_size:#x}");
        Ok(new_size)
    }

    /// Shrink the heap from `old_size` to `new_size`, freeing the pages in
    /// between. Returns the new size, or `old_size` if `new_size` is larger.
    ///
    /// # Errors
    /// [`VmmError::Map`] if a superpage straddling `new_size` cannot be
    /// demoted; nothing is unmapped then.
    pub fn shrink(&mut self, old_size: u64, new_size: u64) -> Result<u64, VmmError> {
        if new_size >= old_size {
            return Ok(old_size);
        }

        let from = page_round_up::<Size4K>(new_size);
        let to = page_round_up::<Size4K>(old_size);
        if from < to {
            self.unmap(VirtualAddress::new(from), (to - from) / Size4K::SIZE, true)?;
        }
        log::debug!("shrink {old_size:#x} -> {new_size:#x}");
        Ok(new_size)
    }

    /// Remove `npages` pages of mappings starting at `va`, optionally
    /// freeing the memory behind them. Missing mappings are skipped.
    ///
    /// A superpage the range fully covers is released as one unit. One the
    /// range only partly covers is demoted first and retired from the pool;
    /// its frames are handled as normal pages from then on.
    ///
    /// # Errors
    /// [`VmmError::Map`] if a demotion runs out of memory. Demotions happen
    /// before anything is unmapped, so no mapping is lost.
    ///
    /// # Panics
    /// If `va` is not page aligned, or the range wraps past the top of the
    /// address space.
    pub fn unmap(&mut self, va: VirtualAddress, npages: u64, free: bool) -> Result<(), VmmError> {
        assert!(va.is_aligned::<Size4K>(), "unmap: {va} not aligned");
        if npages == 0 {
            return Ok(());
        }

        let start = va.as_u64();
        let Some(end) = npages
            .checked_mul(Size4K::SIZE)
            .and_then(|len| start.checked_add(len))
        else {
            panic!("unmap: {npages:#x} pages from {va} overflow the address space");
        };
        self.demote_straddling(start, end)?;
        self.release_range(start, end, free);
        Ok(())
    }

    /// Copy every mapping in `[0, size)` into `dst`, memory included.
    ///
    /// # Errors
    /// Out of memory. Whatever was copied into `dst` is released again.
    pub fn copy(&self, dst: &mut Self, size: u64) -> Result<(), VmmError> {
        self.copy_range(
            dst,
            VirtualAddress::zero(),
            VirtualAddress::new(page_round_up::<Size4K>(size)),
        )
    }

    /// Copy the mappings in `[start, end)` into `dst`. Unmapped pages are
    /// skipped; `dst` must have nothing mapped in the range.
    ///
    /// Superpages that lie entirely inside the range are copied into a new
    /// superpage, or into 512 pages with the same permissions when the pool
    /// is empty.
    ///
    /// # Errors
    /// Out of memory. Whatever was copied into `dst` is released again.
    pub fn copy_range(
        &self,
        dst: &mut Self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmmError> {
        assert!(start.is_aligned::<Size4K>(), "copy: {start} not aligned");

        let dst = &*dst;
        let end = end.as_u64();
        let mut installed = Installed::new(dst, start.as_u64());

        let mut a = start.as_u64();
        while a < end {
            let va = VirtualAddress::new(a);
            match self.aspace.lookup(va) {
                None => a += Size4K::SIZE,
                Some(EntryKind::LargeLeaf(extent, perm))
                    if va.is_aligned::<Size2M>() && a + Size2M::SIZE <= end =>
                {
                    installed.extend_to(a + Size2M::SIZE);
                    dst.copy_superpage(va, extent, perm)?;
                    a += Size2M::SIZE;
                }
                Some(EntryKind::LargeLeaf(extent, perm)) => {
                    let frame = extent.join(va.offset::<Size2M>()).page::<Size4K>();
                    installed.extend_to(a + Size4K::SIZE);
                    dst.copy_page(va, frame, perm)?;
                    a += Size4K::SIZE;
                }
                Some(EntryKind::NormalLeaf(frame, perm)) => {
                    installed.extend_to(a + Size4K::SIZE);
                    dst.copy_page(va, frame, perm)?;
                    a += Size4K::SIZE;
                }
                Some(EntryKind::PointerTable(_)) => unreachable!("lookup yields leaves only"),
            }
        }

        installed.commit();
        log::debug!("copied {start}..{end:#x}");
        Ok(())
    }

    /// A new address space holding a copy of `[0, size)`.
    ///
    /// # Errors
    /// Out of memory; nothing of the new space survives.
    pub fn duplicate(&self, size: u64) -> Result<Self, VmmError> {
        let mut child = Self::create(self.pmm)?;
        if let Err(e) = self.copy(&mut child, size) {
            child.free(0);
            return Err(e);
        }
        Ok(child)
    }

    /// Free the heap `[0, size)` and every page-table frame.
    ///
    /// # Panics
    /// If anything outside the heap is still mapped.
    pub fn free(self, size: u64) {
        let mut end = page_round_up::<Size4K>(size);
        if end > 0 {
            let last = VirtualAddress::new(end - Size4K::SIZE).align_down::<Size2M>();
            if self.is_superpage(last) {
                end = last.as_u64() + Size2M::SIZE;
            }
        }
        self.release_range(0, end, true);
        self.aspace.free_tables(self.pmm);
    }

    /// Back the heap page containing `va` with a zeroed frame mapped
    /// `R|W|U`, and return the frame's physical address.
    ///
    /// Only covers lazily grown heap memory below `size`.
    ///
    /// # Errors
    /// - [`FaultError::OutOfRange`] if `va` is at or beyond `size`.
    /// - [`FaultError::AlreadyMapped`] if the page is already present.
    /// - [`FaultError::OutOfMemory`] if no frame is left.
    pub fn resolve_fault(
        &mut self,
        size: u64,
        va: VirtualAddress,
        is_write: bool,
    ) -> Result<PhysicalAddress, FaultError> {
        if va.as_u64() >= size || va.as_u64() >= USER_TOP {
            return Err(FaultError::OutOfRange(va));
        }
        let page = va.align_down::<Size4K>();
        if self.aspace.is_mapped(page) {
            return Err(FaultError::AlreadyMapped(page));
        }

        let frame = self
            .install_zeroed(page, Perm::USER_RW)
            .map_err(|_| FaultError::OutOfMemory)?;
        log::trace!(
            "{} fault at {va} backed by {frame}",
            if is_write { "write" } else { "read" }
        );
        Ok(frame.base())
    }

    /// Map the caller's `frame` at the page-aligned `va`.
    ///
    /// # Errors
    /// [`VmmError::Map`] if a table frame cannot be allocated; the caller
    /// still owns `frame` then.
    ///
    /// # Panics
    /// If `va` is already mapped.
    pub fn map_frame(
        &mut self,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        perm: Perm,
    ) -> Result<(), VmmError> {
        self.aspace.map_pages(self.pmm, va, Size4K::SIZE, frame.base(), perm)?;
        log::trace!("map {va} -> {frame}");
        Ok(())
    }

    /// Copy `src` to user memory at `dst`.
    ///
    /// # Errors
    /// [`VmmError::Unmapped`] / [`VmmError::ReadOnly`] for the first page
    /// that is missing or not writable; bytes before it are already copied.
    pub fn copy_out(&mut self, dst: VirtualAddress, mut src: &[u8]) -> Result<(), VmmError> {
        let mut va = dst;
        while !src.is_empty() {
            let page = va.align_down::<Size4K>();
            let (pa, perm) = self.translate(page).ok_or(VmmError::Unmapped(page))?;
            if !perm.contains(Perm::WRITE) {
                return Err(VmmError::ReadOnly(page));
            }

            let off = va.offset::<Size4K>();
            let n = ((Size4K::SIZE - off) as usize).min(src.len());
            unsafe { copy_nonoverlapping(src.as_ptr(), self.pmm.mapper().phys_to_ptr(pa + off), n) };
            src = &src[n..];
            va = page + Size4K::SIZE;
        }
        Ok(())
    }

    /// Fill `dst` from user memory at `src`.
    ///
    /// # Errors
    /// [`VmmError::Unmapped`] for the first page that is missing.
    pub fn copy_in(&self, mut dst: &mut [u8], src: VirtualAddress) -> Result<(), VmmError> {
        let mut va = src;
        while !dst.is_empty() {
            let page = va.align_down::<Size4K>();
            let (pa, _) = self.translate(page).ok_or(VmmError::Unmapped(page))?;

            let off = va.offset::<Size4K>();
            let n = ((Size4K::SIZE - off) as usize).min(dst.len());
            unsafe { copy_nonoverlapping(self.pmm.mapper().phys_to_ptr(pa + off), dst.as_mut_ptr(), n) };
            dst = &mut dst[n..];
            va = page + Size4K::SIZE;
        }
        Ok(())
    }

    /// Copy the NUL-terminated string at `src` into `dst`, terminator
    /// included, and return its length without the terminator. At most
    /// `dst.len()` bytes are read.
    ///
    /// # Errors
    /// - [`VmmError::Unmapped`] for the first missing page before the
    ///   terminator.
    /// - [`VmmError::Unterminated`] if `dst` fills up first.
    pub fn copy_in_str(&self, dst: &mut [u8], src: VirtualAddress) -> Result<usize, VmmError> {
        let mut va = src;
        let mut copied = 0;
        while copied < dst.len() {
            let page = va.align_down::<Size4K>();
            let (pa, _) = self.translate(page).ok_or(VmmError::Unmapped(page))?;

            let off = va.offset::<Size4K>();
            let n = ((Size4K::SIZE - off) as usize).min(dst.len() - copied);
            let bytes = unsafe {
                core::slice::from_raw_parts(self.pmm.mapper().phys_to_ptr(pa + off).cast_const(), n)
            };
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                dst[copied..=copied + nul].copy_from_slice(&bytes[..=nul]);
                return Ok(copied + nul);
            }
            dst[copied..copied + n].copy_from_slice(bytes);
            copied += n;
            va = page + Size4K::SIZE;
        }
        Err(VmmError::Unterminated(src))
    }

    /// Revoke user access to the page at `va` (stack guard page), demoting
    /// a superpage around it first.
    ///
    /// # Errors
    /// [`VmmError::Map`] if the demotion runs out of memory.
    ///
    /// # Panics
    /// If `va` is not mapped.
    pub fn clear_user(&mut self, va: VirtualAddress) -> Result<(), VmmError> {
        let base = va.align_down::<Size2M>();
        if self.is_superpage(base) {
            self.demote(base)?;
        }
        self.aspace.clear_user(va.align_down::<Size4K>());
        Ok(())
    }

    fn install_zeroed(
        &self,
        va: VirtualAddress,
        perm: Perm,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let frame = self.pmm.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        unsafe { self.pmm.mapper().fill(frame, 0) };
        if let Err(e) = self.aspace.map_pages(self.pmm, va, Size4K::SIZE, frame.base(), perm) {
            self.pmm.free_4k(frame);
            return Err(e.into());
        }
        log::trace!("map {va} -> {frame}");
        Ok(frame)
    }

    fn copy_page(
        &self,
        va: VirtualAddress,
        src: PhysicalPage<Size4K>,
        perm: Perm,
    ) -> Result<(), VmmError> {
        let frame = self.pmm.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        unsafe { self.pmm.mapper().copy_page(src, frame) };
        if let Err(e) = self.aspace.map_pages(self.pmm, va, Size4K::SIZE, frame.base(), perm) {
            self.pmm.free_4k(frame);
            return Err(e.into());
        }
        Ok(())
    }

    fn copy_superpage(
        &self,
        va: VirtualAddress,
        src: PhysicalPage<Size2M>,
        perm: Perm,
    ) -> Result<(), VmmError> {
        let Some(extent) = self.pmm.alloc_2m() else {
            log::debug!("copy: superpage pool empty, copying {va} as 4 KiB pages");
            let mut page_va = va;
            for frame in src.frames() {
                self.copy_page(page_va, frame, perm)?;
                page_va += Size4K::SIZE;
            }
            return Ok(());
        };

        unsafe { self.pmm.mapper().copy_page(src, extent) };
        if let Err(e) = self.aspace.map_large(self.pmm, va, extent, perm) {
            self.pmm.free_2m(extent);
            return Err(e.into());
        }
        Ok(())
    }

    fn demote(&self, base: VirtualAddress) -> Result<(), VmmError> {
        let extent = self.aspace.demote(self.pmm, base)?;
        self.pmm.split_superpage(extent);
        Ok(())
    }

    /// Demote the superpages at either edge of `[start, end)` that the
    /// range does not fully cover.
    fn demote_straddling(&self, start: u64, end: u64) -> Result<(), VmmError> {
        for edge in [start, end - Size4K::SIZE] {
            let base = VirtualAddress::new(edge).align_down::<Size2M>();
            let covered = base.as_u64() >= start && base.as_u64() + Size2M::SIZE <= end;
            if !covered && self.is_superpage(base) {
                self.demote(base)?;
            }
        }
        Ok(())
    }

    /// Unmap everything in `[start, end)`. Superpages must lie entirely
    /// inside the range.
    fn release_range(&self, start: u64, end: u64, free: bool) {
        let mut a = start;
        while a < end {
            let va = VirtualAddress::new(a);
            let next_window = va.align_down::<Size2M>().as_u64() + Size2M::SIZE;
            let Some(slot) = self.aspace.walk_large(va) else {
                a = next_window;
                continue;
            };

            match self.aspace.kind(slot) {
                None => a = next_window,
                Some(EntryKind::LargeLeaf(extent, _)) => {
                    assert!(
                        va.is_aligned::<Size2M>() && next_window <= end,
                        "unmap: {va}..{end:#x} cuts through superpage {extent}"
                    );
                    self.aspace.unmap_large(va);
                    if free {
                        self.pmm.free_2m(extent);
                    }
                    a = next_window;
                }
                Some(_) => {
                    if let Some((frame, _)) = self.aspace.unmap_page(va)
                        && free
                    {
                        self.pmm.free_4k(frame);
                    }
                    a += Size4K::SIZE;
                }
            }
        }
    }
}

/// Range `[start, end)` installed by an operation in progress. Everything
/// in it is unmapped and freed on drop, unless committed.
struct Installed<'a, 'p, M: PhysMapper> {
    vmm: &'a Vmm<'p, M>,
    start: u64,
    end: u64,
    committed: bool,
}

impl<'a, 'p, M: PhysMapper> Installed<'a, 'p, M> {
    const fn new(vmm: &'a Vmm<'p, M>, start: u64) -> Self {
        Self {
            vmm,
            start,
            end: start,
            committed: false,
        }
    }

    const fn extend_to(&mut self, end: u64) {
        self.end = end;
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<M: PhysMapper> Drop for Installed<'_, '_, M> {
    fn drop(&mut self) {
        if self.committed || self.end <= self.start {
            return;
        }
        log::warn!("rolling back {:#x}..{:#x}", self.start, self.end);
        self.vmm.release_range(self.start, self.end, true);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("invalid range")]
    InvalidRange,
    #[error("access to unmapped memory at {0}")]
    Unmapped(VirtualAddress),
    #[error("write to read-only memory at {0}")]
    ReadOnly(VirtualAddress),
    #[error("string at {0} is longer than the buffer")]
    Unterminated(VirtualAddress),
}

impl VmmError {
    /// `true` for every flavor of memory exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Map(MapError::OutOfMemory(_)))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("{0} lies beyond the process size")]
    OutOfRange(VirtualAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("out of memory")]
    OutOfMemory,
}

#[cfg(test)]
mod tests;
