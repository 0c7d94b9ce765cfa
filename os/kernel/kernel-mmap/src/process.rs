//! # Process Memory
//!
//! [`ProcessMemory`] is everything a process owns of user memory: its page
//! table, the heap watermark and the mapped-region table. Page faults enter
//! through [`ProcessMemory::handle_fault`], which serves mapped regions from
//! their file and everything else as lazily grown heap.

use crate::file::{BackingFile, FileError, Transaction};
use crate::vma::{Prot, Sharing, Vma, VmaTable};
use alloc::sync::Arc;
use kernel_alloc::{FaultError, Pmm, Vmm, VmmError};
use kernel_info::memory::{NVMA, USER_TOP};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, page_round_up};
use kernel_vmem::{FrameAlloc, Perm, PhysMapper};

/// How [`ProcessMemory::sbrk`] grows the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SbrkMode {
    /// Back the new range right away.
    Eager,
    /// Only move the watermark; pages appear on first touch.
    Lazy,
}

/// User memory of one process.
pub struct ProcessMemory<'p, M: PhysMapper, F: BackingFile + ?Sized> {
    vmm: Vmm<'p, M>,
    size: u64,
    vmas: VmaTable<F>,
}

/// Which part of a region an unmap request removes.
#[derive(Copy, Clone, Debug)]
enum Cut {
    Whole,
    /// Everything below the address.
    Prefix(VirtualAddress),
    /// Everything from the address on.
    Suffix(VirtualAddress),
}

impl<'p, M: PhysMapper, F: BackingFile + ?Sized> ProcessMemory<'p, M, F> {
    /// Empty process memory: no heap, no regions.
    ///
    /// # Errors
    /// If the root table cannot be allocated.
    pub fn create(pmm: &'p Pmm<M>) -> Result<Self, MmapError> {
        Ok(Self {
            vmm: Vmm::create(pmm)?,
            size: 0,
            vmas: VmaTable::new(),
        })
    }

    /// Heap watermark in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &Vmm<'p, M> {
        &self.vmm
    }

    #[inline]
    #[must_use]
    pub const fn vmas(&self) -> &VmaTable<F> {
        &self.vmas
    }

    /// Move the heap watermark by `n` bytes and return the old one.
    ///
    /// Shrinking always frees the pages right away. Growth may not reach the
    /// lowest mapped region.
    ///
    /// # Errors
    /// - [`MmapError::InvalidArgument`] when shrinking below zero.
    /// - [`MmapError::NoSpace`] when growing into a region or past the
    ///   user range.
    /// - [`MmapError::Vmm`] when eager growth runs out of memory; the
    ///   watermark is unchanged then.
    pub fn sbrk(&mut self, n: i64, mode: SbrkMode) -> Result<u64, MmapError> {
        let old = self.size;
        if n < 0 {
            let new = old
                .checked_sub(n.unsigned_abs())
                .ok_or(MmapError::InvalidArgument)?;
            self.size = self.vmm.shrink(old, new)?;
            return Ok(old);
        }

        let limit = self.vmas.lowest_start().map_or(USER_TOP, VirtualAddress::as_u64);
        let Some(new) = old.checked_add(n.unsigned_abs()).filter(|&new| new <= limit) else {
            log::warn!("sbrk: {n:#x} bytes from {old:#x} would pass {limit:#x}");
            return Err(MmapError::NoSpace);
        };
        self.size = match mode {
            SbrkMode::Eager => self.vmm.grow(old, new, Perm::WRITE)?,
            SbrkMode::Lazy => new,
        };
        Ok(old)
    }

    /// Map `len` bytes of `file` from `offset` on and return the start
    /// address, which is always chosen here; `addr` must be zero.
    ///
    /// No memory is allocated; pages are read in on first access.
    ///
    /// # Errors
    /// - [`MmapError::InvalidArgument`] for a non-zero `addr`, a zero `len`,
    ///   or an `offset` whose region end does not fit in a file offset.
    /// - [`MmapError::NotReadable`] / [`MmapError::NotWritable`] if the file
    ///   was not opened for the requested access.
    /// - [`MmapError::NoSpace`] if the region would reach the trap frame.
    /// - [`MmapError::NoSlot`] if the region table is full.
    pub fn map_region(
        &mut self,
        addr: u64,
        len: u64,
        prot: Prot,
        sharing: Sharing,
        file: &Arc<F>,
        offset: u64,
    ) -> Result<VirtualAddress, MmapError> {
        if addr != 0 || len == 0 {
            return Err(MmapError::InvalidArgument);
        }
        if prot.contains(Prot::READ) && !file.readable() {
            return Err(MmapError::NotReadable);
        }
        if prot.contains(Prot::WRITE) && sharing == Sharing::Shared && !file.writable() {
            return Err(MmapError::NotWritable);
        }

        let start = self.vmas.placement(self.size);
        let fits = len <= USER_TOP
            && start
                .checked_add(page_round_up::<Size4K>(len))
                .is_some_and(|end| end.as_u64() <= USER_TOP);
        if !fits {
            log::warn!("mmap: {len:#x} bytes at {start} would reach the trap frame");
            return Err(MmapError::NoSpace);
        }
        if offset.checked_add(page_round_up::<Size4K>(len)).is_none() {
            log::warn!("mmap: offset {offset:#x} + {len:#x} bytes passes the end of any file");
            return Err(MmapError::InvalidArgument);
        }

        let vma = Vma::new(start, len, prot, sharing, Arc::clone(file), offset);
        let index = self.vmas.insert(vma).map_err(|_| MmapError::NoSlot)?;
        log::debug!("mmap: slot {index} at {start}, {len:#x} bytes from offset {offset:#x}");
        Ok(start)
    }

    /// Unmap `[addr, addr + len)` from every region it touches. A region
    /// may lose all of its range, a prefix or a suffix; shared regions write
    /// their mapped pages back first.
    ///
    /// # Errors
    /// - [`MmapError::InvalidArgument`] for an unaligned `addr` or a zero
    ///   `len`.
    /// - [`MmapError::Hole`] if the range lies strictly inside a region;
    ///   nothing changes then.
    pub fn unmap_region(&mut self, addr: VirtualAddress, len: u64) -> Result<(), MmapError> {
        if len == 0 || len > USER_TOP || !addr.is_aligned::<Size4K>() {
            return Err(MmapError::InvalidArgument);
        }
        let end = addr
            .checked_add(page_round_up::<Size4K>(len))
            .ok_or(MmapError::InvalidArgument)?;

        let mut plan: [Option<Cut>; NVMA] = [None; NVMA];
        for (index, vma) in self.vmas.iter() {
            let lo = addr.max(vma.addr());
            let hi = end.min(vma.end());
            if lo >= hi {
                continue;
            }
            plan[index] = Some(match (lo == vma.addr(), hi == vma.end()) {
                (true, true) => Cut::Whole,
                (true, false) => Cut::Prefix(hi),
                (false, true) => Cut::Suffix(lo),
                (false, false) => {
                    log::warn!("munmap: {lo}..{hi} is inside {vma:?}");
                    return Err(MmapError::Hole);
                }
            });
        }

        for (index, cut) in plan.into_iter().enumerate() {
            match cut {
                None => {}
                Some(Cut::Whole) => {
                    if let Some(vma) = self.vmas.take(index) {
                        unmap_pages(&mut self.vmm, &vma, vma.addr(), vma.end(), true)?;
                        log::debug!("munmap: slot {index} released");
                    }
                }
                Some(Cut::Prefix(to)) => {
                    if let Some(vma) = self.vmas.get_mut(index) {
                        unmap_pages(&mut self.vmm, vma, vma.addr(), to, true)?;
                        vma.trim_front(to - vma.addr());
                        log::debug!("munmap: slot {index} now starts at {to}");
                    }
                }
                Some(Cut::Suffix(from)) => {
                    if let Some(vma) = self.vmas.get_mut(index) {
                        unmap_pages(&mut self.vmm, vma, from, vma.end(), true)?;
                        vma.truncate(from - vma.addr());
                        log::debug!("munmap: slot {index} now ends at {from}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a page fault at `va`. Inside a mapped region the page is
    /// read from the file; elsewhere it is lazily grown heap.
    ///
    /// Returns the physical address of the new page.
    ///
    /// # Errors
    /// - [`MmapError::Protection`] for an access the region does not allow.
    /// - [`MmapError::Fault`] if `va` is already mapped, outside the heap,
    ///   or no memory is left.
    /// - [`MmapError::File`] if the file cannot be read.
    pub fn handle_fault(
        &mut self,
        va: VirtualAddress,
        is_write: bool,
    ) -> Result<PhysicalAddress, MmapError> {
        match self.vmas.find(va) {
            Some((_, vma)) => {
                let vma = vma.clone();
                self.fault_in_region(&vma, va, is_write)
            }
            None => Ok(self.vmm.resolve_fault(self.size, va, is_write)?),
        }
    }

    /// Copy `src` to user memory at `dst`, faulting missing pages in.
    ///
    /// # Errors
    /// If a page cannot be faulted in or is not writable.
    pub fn copy_out(&mut self, dst: VirtualAddress, src: &[u8]) -> Result<(), MmapError> {
        self.fault_in(dst, src.len() as u64, true)?;
        Ok(self.vmm.copy_out(dst, src)?)
    }

    /// Fill `dst` from user memory at `src`, faulting missing pages in.
    ///
    /// # Errors
    /// If a page cannot be faulted in.
    pub fn copy_in(&mut self, dst: &mut [u8], src: VirtualAddress) -> Result<(), MmapError> {
        self.fault_in(src, dst.len() as u64, false)?;
        Ok(self.vmm.copy_in(dst, src)?)
    }

    /// Copy the NUL-terminated string at `src` into `dst`, faulting pages
    /// in as the string reaches them. Returns the length without the NUL.
    ///
    /// # Errors
    /// If a page cannot be faulted in or the string does not fit `dst`.
    pub fn copy_in_str(&mut self, dst: &mut [u8], src: VirtualAddress) -> Result<usize, MmapError> {
        loop {
            match self.vmm.copy_in_str(dst, src) {
                Err(VmmError::Unmapped(page)) => {
                    self.handle_fault(page, false)?;
                }
                result => return Ok(result?),
            }
        }
    }

    /// A child with a copy of the heap, every region (each holding its own
    /// file reference) and the region pages faulted in so far.
    ///
    /// # Errors
    /// Out of memory; nothing of the child survives.
    pub fn fork(&self) -> Result<Self, MmapError> {
        let vmm = self.vmm.duplicate(self.size)?;
        let mut child = Self {
            vmm,
            size: self.size,
            vmas: self.vmas.clone(),
        };

        for (_, vma) in self.vmas.iter() {
            if let Err(e) = self.vmm.copy_range(&mut child.vmm, vma.addr(), vma.end()) {
                child.teardown(false);
                return Err(e.into());
            }
        }
        log::debug!(
            "fork: {:#x} bytes of heap, {} regions",
            self.size,
            self.vmas.len()
        );
        Ok(child)
    }

    /// Unmap every region, writing shared ones back, then free the heap
    /// and the page tables.
    pub fn release(self) {
        self.teardown(true);
    }

    fn teardown(self, write_back: bool) {
        let Self {
            mut vmm,
            size,
            mut vmas,
        } = self;
        for index in 0..NVMA {
            let Some(vma) = vmas.take(index) else {
                continue;
            };
            if let Err(e) = unmap_pages(&mut vmm, &vma, vma.addr(), vma.end(), write_back) {
                log::warn!("exit: unmapping {vma:?} failed: {e}");
            }
        }
        vmm.free(size);
    }

    fn fault_in(&mut self, start: VirtualAddress, len: u64, is_write: bool) -> Result<(), MmapError> {
        if len == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(len)
            .filter(|end| end.as_u64() <= USER_TOP)
            .ok_or(MmapError::InvalidArgument)?;

        let mut page = start.align_down::<Size4K>();
        while page < end {
            if !self.vmm.is_mapped(page) {
                self.handle_fault(page, is_write)?;
            }
            page += Size4K::SIZE;
        }
        Ok(())
    }

    fn fault_in_region(
        &mut self,
        vma: &Vma<F>,
        va: VirtualAddress,
        is_write: bool,
    ) -> Result<PhysicalAddress, MmapError> {
        let prot = vma.prot();
        let allowed = if is_write {
            prot.contains(Prot::WRITE)
        } else {
            !prot.is_empty()
        };
        if !allowed {
            log::warn!(
                "{} fault at {va} violates {prot:?}",
                if is_write { "write" } else { "read" }
            );
            return Err(MmapError::Protection(va));
        }

        let page = va.align_down::<Size4K>();
        if self.vmm.is_mapped(page) {
            return Err(FaultError::AlreadyMapped(page).into());
        }

        let pmm = self.vmm.pmm();
        let frame = pmm.alloc_4k().ok_or(FaultError::OutOfMemory)?;
        let bytes = unsafe { pmm.mapper().page_bytes(frame) };
        bytes.fill(0);

        let offset = vma.file_offset(page);
        let file_size = vma.file().size();
        if offset < file_size {
            let n = (file_size - offset).min(Size4K::SIZE) as usize;
            if let Err(e) = vma.file().read_at(offset, &mut bytes[..n]) {
                pmm.free_4k(frame);
                return Err(e.into());
            }
        }

        if let Err(e) = self.vmm.map_frame(page, frame, prot.leaf_perm()) {
            pmm.free_4k(frame);
            return Err(e.into());
        }
        log::trace!("fault at {va} filled from file offset {offset:#x}");
        Ok(frame.base())
    }
}

/// Unmap and free `[from, to)` of `vma`, writing it back first if asked and
/// the region is shared.
fn unmap_pages<M: PhysMapper, F: BackingFile + ?Sized>(
    vmm: &mut Vmm<'_, M>,
    vma: &Vma<F>,
    from: VirtualAddress,
    to: VirtualAddress,
    write_back: bool,
) -> Result<(), VmmError> {
    if write_back && vma.sharing() == Sharing::Shared {
        write_back_range(vmm, vma, from, to);
    }
    vmm.unmap(from, (to - from) / Size4K::SIZE, true)
}

/// Write every mapped page of `[from, to)` to the file, clipped to the file
/// size, one transaction per page. Failed writes are logged and skipped.
fn write_back_range<M: PhysMapper, F: BackingFile + ?Sized>(
    vmm: &Vmm<'_, M>,
    vma: &Vma<F>,
    from: VirtualAddress,
    to: VirtualAddress,
) {
    let file = vma.file();
    let file_size = file.size();
    let mut va = from;
    while va < to {
        let offset = vma.file_offset(va);
        if let Some((pa, _)) = vmm.translate(va)
            && offset < file_size
        {
            let n = (file_size - offset).min(Size4K::SIZE) as usize;
            let bytes =
                unsafe { core::slice::from_raw_parts(vmm.pmm().mapper().phys_to_ptr(pa), n) };

            let _tx = Transaction::begin(&**file);
            match file.write_at(offset, bytes) {
                Ok(written) if written == n => log::trace!("wrote back {va} to offset {offset:#x}"),
                Ok(written) => log::warn!(
                    "munmap: {}",
                    FileError::ShortWrite {
                        offset,
                        written,
                        expected: n
                    }
                ),
                Err(e) => log::warn!("munmap: write-back of {va} failed: {e}"),
            }
        }
        va += Size4K::SIZE;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmapError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file is not open for reading")]
    NotReadable,
    #[error("file is not open for writing")]
    NotWritable,
    #[error("no free mapping slot")]
    NoSlot,
    #[error("not enough address space below the trap frame")]
    NoSpace,
    #[error("cannot unmap the interior of a mapped region")]
    Hole,
    #[error("access at {0} violates the mapping's protection")]
    Protection(VirtualAddress),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Fault(#[from] FaultError),
    #[error(transparent)]
    File(#[from] FileError),
}
