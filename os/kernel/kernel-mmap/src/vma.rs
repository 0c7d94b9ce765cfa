//! # Mapped Regions
//!
//! A [`Vma`] records one file projected into the address space; a process
//! holds up to [`NVMA`] of them in a [`VmaTable`]. Ranges are page aligned
//! and pairwise disjoint, and all of them end at or below
//! [`USER_TOP`](kernel_info::memory::USER_TOP).

use alloc::sync::Arc;
use core::fmt;
use kernel_info::memory::NVMA;
use kernel_memory_addresses::{Size4K, VirtualAddress, page_round_up};
use kernel_vmem::Perm;

bitflags::bitflags! {
    /// Protections requested for a mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Prot {
    /// Leaf bits for a user page with these protections. Sv39 reserves
    /// writable-but-unreadable leaves, so `WRITE` implies `READ`.
    #[must_use]
    pub fn leaf_perm(self) -> Perm {
        let mut perm = Perm::USER;
        perm.set(Perm::READ, self.intersects(Self::READ | Self::WRITE));
        perm.set(Perm::WRITE, self.contains(Self::WRITE));
        perm.set(Perm::EXEC, self.contains(Self::EXEC));
        perm
    }
}

/// What happens to stores into a mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Stores stay in the process.
    Private,
    /// Stores reach the file when the pages are unmapped.
    Shared,
}

/// One mapped region.
pub struct Vma<F: ?Sized> {
    addr: VirtualAddress,
    len: u64,
    prot: Prot,
    sharing: Sharing,
    file: Arc<F>,
    offset: u64,
}

impl<F: ?Sized> Vma<F> {
    /// `len` is rounded up to whole pages.
    ///
    /// # Panics
    /// If `addr` is not page aligned.
    pub fn new(
        addr: VirtualAddress,
        len: u64,
        prot: Prot,
        sharing: Sharing,
        file: Arc<F>,
        offset: u64,
    ) -> Self {
        assert!(addr.is_aligned::<Size4K>(), "vma: {addr} not page aligned");
        Self {
            addr,
            len: page_round_up::<Size4K>(len),
            prot,
            sharing,
            file,
            offset,
        }
    }

    #[inline]
    #[must_use]
    pub const fn addr(&self) -> VirtualAddress {
        self.addr
    }

    /// Length in bytes, a page multiple.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.addr.as_u64() + self.len)
    }

    #[inline]
    #[must_use]
    pub const fn prot(&self) -> Prot {
        self.prot
    }

    #[inline]
    #[must_use]
    pub const fn sharing(&self) -> Sharing {
        self.sharing
    }

    #[inline]
    #[must_use]
    pub const fn file(&self) -> &Arc<F> {
        &self.file
    }

    /// File offset backing [`addr`](Self::addr).
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.addr <= va && va < self.end()
    }

    /// File offset backing `va`, which must lie inside the region.
    #[inline]
    #[must_use]
    pub fn file_offset(&self, va: VirtualAddress) -> u64 {
        debug_assert!(self.contains(va));
        self.offset + (va - self.addr)
    }

    /// Drop the first `bytes` of the region.
    pub(crate) fn trim_front(&mut self, bytes: u64) {
        debug_assert!(bytes < self.len);
        self.addr += bytes;
        self.offset += bytes;
        self.len -= bytes;
    }

    /// Keep only the first `len` bytes of the region.
    pub(crate) fn truncate(&mut self, len: u64) {
        debug_assert!(len > 0 && len < self.len);
        self.len = len;
    }
}

impl<F: ?Sized> Clone for Vma<F> {
    fn clone(&self) -> Self {
        Self {
            file: Arc::clone(&self.file),
            ..*self
        }
    }
}

impl<F: ?Sized> fmt::Debug for Vma<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("addr", &self.addr)
            .field("len", &format_args!("{:#x}", self.len))
            .field("prot", &self.prot)
            .field("sharing", &self.sharing)
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish_non_exhaustive()
    }
}

/// The fixed slot table of one process.
pub struct VmaTable<F: ?Sized> {
    slots: [Option<Vma<F>>; NVMA],
}

impl<F: ?Sized> VmaTable<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Used slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Vma<F>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|vma| (i, vma)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Vma<F>> {
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Vma<F>> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// The region covering `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<(usize, &Vma<F>)> {
        self.iter().find(|(_, vma)| vma.contains(va))
    }

    /// Lowest start address of any region; the heap may not grow past it.
    #[must_use]
    pub fn lowest_start(&self) -> Option<VirtualAddress> {
        self.iter().map(|(_, vma)| vma.addr()).min()
    }

    /// Start address for a new region: the page above `size`, bumped past
    /// the end of every region in use.
    #[must_use]
    pub fn placement(&self, size: u64) -> VirtualAddress {
        let mut addr = page_round_up::<Size4K>(size);
        for (_, vma) in self.iter() {
            if addr < vma.end().as_u64() {
                addr = vma.end().as_u64();
            }
        }
        VirtualAddress::new(addr)
    }

    /// Store `vma` in the first free slot and return its index, or hand it
    /// back if the table is full.
    ///
    /// # Errors
    /// The rejected region if no slot is free.
    pub fn insert(&mut self, vma: Vma<F>) -> Result<usize, Vma<F>> {
        debug_assert!(
            self.iter()
                .all(|(_, other)| vma.end() <= other.addr() || other.end() <= vma.addr()),
            "vma: {vma:?} overlaps a region in use"
        );
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(vma);
                Ok(index)
            }
            None => Err(vma),
        }
    }

    /// Clear slot `index`, returning what it held.
    pub fn take(&mut self, index: usize) -> Option<Vma<F>> {
        self.slots.get_mut(index)?.take()
    }
}

impl<F: ?Sized> Default for VmaTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clones every region; each clone holds its own file reference.
impl<F: ?Sized> Clone for VmaTable<F> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}
