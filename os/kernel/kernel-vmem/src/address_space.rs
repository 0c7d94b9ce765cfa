//! # Address Space (Sv39, L2-rooted)
//!
//! Helpers to build, inspect and tear down a **single** user address space,
//! i.e. the tree rooted at one level-2 table.
//!
//! ## Highlights
//!
//! - [`AddressSpace::walk`] / [`AddressSpace::walk_alloc`] return the level-0
//!   slot for a virtual address; [`AddressSpace::walk_large`] and
//!   [`AddressSpace::walk_large_alloc`] stop one level early at the slot a
//!   superpage would occupy.
//! - [`AddressSpace::is_large`] classifies a [`LargeSlot`]. It is not defined
//!   for a [`LeafSlot`], since the same bits mean "4 KiB page" there.
//! - [`AddressSpace::map_pages`] / [`AddressSpace::map_large`] install leaves;
//!   [`AddressSpace::lookup`] / [`AddressSpace::translate`] read them back,
//!   handling both granularities.
//! - [`AddressSpace::demote`] splits one superpage leaf into 512 page leaves.
//! - [`AddressSpace::free_tables`] releases the table frames at teardown.
//!
//! ## Safety
//!
//! - Mutating an active address space requires `sfence.vma` afterwards.
//! - The provided `PhysMapper` must yield **writable** views of table frames,
//!   and the caller must be the only thread mutating this tree.

mod demote;

use crate::info::MAXVA;
use crate::page_table::{ENTRIES, EntryKind, Level, PageTableEntry, Perm, TableIndex};
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress,
};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// A slot in one table, tagged with the level the table lives at.
pub trait Slot: Copy {
    const LEVEL: Level;

    fn table(self) -> PhysicalPage<Size4K>;
    fn index(self) -> TableIndex;
}

/// Level-0 slot: holds a 4 KiB leaf or nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LeafSlot {
    table: PhysicalPage<Size4K>,
    index: TableIndex,
}

/// Level-1 slot: holds a superpage leaf, a pointer to a level-0 table, or nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LargeSlot {
    table: PhysicalPage<Size4K>,
    index: TableIndex,
}

impl Slot for LeafSlot {
    const LEVEL: Level = Level::L0;

    fn table(self) -> PhysicalPage<Size4K> {
        self.table
    }

    fn index(self) -> TableIndex {
        self.index
    }
}

impl Slot for LargeSlot {
    const LEVEL: Level = Level::L1;

    fn table(self) -> PhysicalPage<Size4K> {
        self.table
    }

    fn index(self) -> TableIndex {
        self.index
    }
}

/// Error returned when a page-table frame cannot be allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating an {0} table")]
    OutOfMemory(Level),
}

/// Allocator type for the non-allocating walks; it has no values.
enum NoAlloc {}

impl FrameAlloc for NoAlloc {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        match *self {}
    }

    fn free_4k(&self, _page: PhysicalPage<Size4K>) {
        match *self {}
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a fresh root table.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available.
    pub fn create<A: FrameAlloc>(mapper: &'m M, alloc: &A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory(Level::L2))?;
        unsafe { mapper.table_mut(root).zero() };
        Ok(Self { root, mapper })
    }

    /// Physical page of the level-2 table.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// `satp` value selecting Sv39 with this root.
    #[inline]
    #[must_use]
    pub const fn satp(&self) -> u64 {
        const SATP_SV39: u64 = 8 << 60;
        SATP_SV39 | (self.root.base().as_u64() >> 12)
    }

    /// Install this address space on the current hart.
    ///
    /// # Safety
    /// The kernel's own code and data must be mapped identically in this
    /// space, and the trampoline must be present.
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self) {
        unsafe {
            core::arch::asm!(
                "sfence.vma zero, zero",
                "csrw satp, {}",
                "sfence.vma zero, zero",
                in(reg) self.satp(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Descend from the root to the table at `target` that covers `va`.
    ///
    /// Missing tables are created (zero-filled) when `alloc` is given and
    /// reported as `Ok(None)` otherwise. A leaf above `target` is `Ok(None)`
    /// for a lookup and a remap violation for an allocating walk.
    fn table_for<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        target: Level,
        alloc: Option<&A>,
    ) -> Result<Option<PhysicalPage<Size4K>>, MapError> {
        assert!(va.as_u64() < MAXVA, "walk: {va} beyond MAXVA");

        let mut table = self.root;
        let mut level = Level::L2;
        while level != target {
            let Some(below) = level.next() else { break };
            let idx = level.index_of(va);
            let t = unsafe { self.mapper.table_mut(table) };

            table = match t.get(idx).kind(level) {
                Some(EntryKind::PointerTable(next)) => next,
                Some(_) if alloc.is_some() => panic!("walk: {va} lies inside a superpage"),
                Some(_) => return Ok(None),
                None => {
                    let Some(alloc) = alloc else {
                        return Ok(None);
                    };
                    let next = alloc.alloc_4k().ok_or(MapError::OutOfMemory(below))?;
                    unsafe { self.mapper.table_mut(next).zero() };
                    t.set(idx, PageTableEntry::pointer(next));
                    next
                }
            };
            level = below;
        }
        Ok(Some(table))
    }

    /// Level-0 slot for `va`, or `None` if a table on the way is missing.
    ///
    /// # Panics
    /// If `va >= MAXVA`.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<LeafSlot> {
        let table = self.table_for::<NoAlloc>(va, Level::L0, None).ok()??;
        Some(LeafSlot {
            table,
            index: Level::L0.index_of(va),
        })
    }

    /// Level-0 slot for `va`, creating intermediate tables.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table frame cannot be allocated. Tables
    /// created before the failure stay linked (and empty).
    pub fn walk_alloc<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<LeafSlot, MapError> {
        match self.table_for(va, Level::L0, Some(alloc))? {
            Some(table) => Ok(LeafSlot {
                table,
                index: Level::L0.index_of(va),
            }),
            None => unreachable!("allocating walk always reaches its level"),
        }
    }

    /// Level-1 slot for `va`, or `None` if the level-1 table is missing.
    #[must_use]
    pub fn walk_large(&self, va: VirtualAddress) -> Option<LargeSlot> {
        let table = self.table_for::<NoAlloc>(va, Level::L1, None).ok()??;
        Some(LargeSlot {
            table,
            index: Level::L1.index_of(va),
        })
    }

    /// Level-1 slot for `va`, creating the level-1 table if needed.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the table frame cannot be allocated.
    pub fn walk_large_alloc<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<LargeSlot, MapError> {
        match self.table_for(va, Level::L1, Some(alloc))? {
            Some(table) => Ok(LargeSlot {
                table,
                index: Level::L1.index_of(va),
            }),
            None => unreachable!("allocating walk always reaches its level"),
        }
    }

    /// Read the entry in `slot`.
    #[inline]
    #[must_use]
    pub fn entry<S: Slot>(&self, slot: S) -> PageTableEntry {
        unsafe { self.mapper.table_mut(slot.table()) }.get(slot.index())
    }

    /// Overwrite the entry in `slot`.
    #[inline]
    pub fn set_entry<S: Slot>(&self, slot: S, e: PageTableEntry) {
        unsafe { self.mapper.table_mut(slot.table()) }.set(slot.index(), e);
    }

    /// Decode the entry in `slot` at the slot's level.
    #[inline]
    #[must_use]
    pub fn kind<S: Slot>(&self, slot: S) -> Option<EntryKind> {
        self.entry(slot).kind(S::LEVEL)
    }

    /// `true` iff `slot` holds a superpage leaf.
    #[inline]
    #[must_use]
    pub fn is_large(&self, slot: LargeSlot) -> bool {
        self.entry(slot).is_leaf()
    }

    /// The leaf translating `va`: [`EntryKind::NormalLeaf`],
    /// [`EntryKind::LargeLeaf`], or `None` if unmapped.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<EntryKind> {
        let large = self.walk_large(va)?;
        match self.kind(large)? {
            EntryKind::PointerTable(table) => self.kind(LeafSlot {
                table,
                index: Level::L0.index_of(va),
            }),
            leaf => Some(leaf),
        }
    }

    /// Translate `va` to its physical address and leaf permissions.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Perm)> {
        match self.lookup(va)? {
            EntryKind::NormalLeaf(frame, perm) => Some((frame.join(va.offset::<Size4K>()), perm)),
            EntryKind::LargeLeaf(extent, perm) => Some((extent.join(va.offset::<Size2M>()), perm)),
            EntryKind::PointerTable(_) => None,
        }
    }

    /// [`translate`](Self::translate), restricted to user-accessible leaves.
    ///
    /// Unlike the walkers this never panics: addresses at or above `MAXVA`
    /// simply have no translation.
    #[must_use]
    pub fn translate_user(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Perm)> {
        if va.as_u64() >= MAXVA {
            return None;
        }
        self.translate(va).filter(|(_, perm)| perm.contains(Perm::USER))
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.lookup(va).is_some()
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` with 4 KiB leaves.
    ///
    /// All-or-nothing: if a table frame runs out part-way, the leaves
    /// installed by this call are removed again.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table frame cannot be allocated.
    ///
    /// # Panics
    /// On an unaligned `va`, `pa` or `size`, a zero `size`, or if any page in
    /// the range is already mapped.
    pub fn map_pages<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        perm: Perm,
    ) -> Result<(), MapError> {
        assert!(va.is_aligned::<Size4K>(), "map_pages: va {va} not aligned");
        assert!(pa.is_aligned::<Size4K>(), "map_pages: pa {pa} not aligned");
        assert!(size.is_multiple_of(Size4K::SIZE), "map_pages: size {size:#x} not aligned");
        assert!(size != 0, "map_pages: size");

        for i in 0..size / Size4K::SIZE {
            let page_va = va + i * Size4K::SIZE;
            let slot = match self.walk_alloc(alloc, page_va) {
                Ok(slot) => slot,
                Err(e) => {
                    for j in 0..i {
                        self.unmap_page(va + j * Size4K::SIZE);
                    }
                    return Err(e);
                }
            };
            assert!(!self.entry(slot).valid(), "map_pages: remap at {page_va}");
            let frame = (pa + i * Size4K::SIZE).page();
            self.set_entry(slot, PageTableEntry::page(frame, perm));
        }
        Ok(())
    }

    /// Map the superpage `extent` at the 2 MiB-aligned `va`.
    ///
    /// An empty level-0 table left in the slot by earlier unmaps is released
    /// and replaced.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the level-1 table cannot be allocated.
    ///
    /// # Panics
    /// If `va` is not 2 MiB aligned, or anything is mapped in its range.
    pub fn map_large<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        extent: PhysicalPage<Size2M>,
        perm: Perm,
    ) -> Result<(), MapError> {
        assert!(va.is_aligned::<Size2M>(), "map_large: va {va} not aligned");

        let slot = self.walk_large_alloc(alloc, va)?;
        match self.kind(slot) {
            None => {}
            Some(EntryKind::PointerTable(table)) if unsafe { self.mapper.table_mut(table) }.is_empty() => {
                self.set_entry(slot, PageTableEntry::zero());
                alloc.free_4k(table);
            }
            Some(_) => panic!("map_large: remap at {va}"),
        }
        self.set_entry(slot, PageTableEntry::superpage(extent, perm));
        Ok(())
    }

    /// Clear the 4 KiB leaf at `va`, returning the frame it mapped.
    pub fn unmap_page(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size4K>, Perm)> {
        let slot = self.walk(va)?;
        let Some(EntryKind::NormalLeaf(frame, perm)) = self.kind(slot) else {
            return None;
        };
        self.set_entry(slot, PageTableEntry::zero());
        Some((frame, perm))
    }

    /// Clear the superpage leaf at `va`, returning the extent it mapped.
    pub fn unmap_large(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size2M>, Perm)> {
        let slot = self.walk_large(va)?;
        let Some(EntryKind::LargeLeaf(extent, perm)) = self.kind(slot) else {
            return None;
        };
        self.set_entry(slot, PageTableEntry::zero());
        Some((extent, perm))
    }

    /// Revoke user access to the 4 KiB page at `va` (stack guard pages).
    ///
    /// # Panics
    /// If `va` is not mapped by a 4 KiB leaf.
    pub fn clear_user(&self, va: VirtualAddress) {
        let slot = self
            .walk(va)
            .unwrap_or_else(|| panic!("clear_user: no page at {va}"));
        let e = self.entry(slot);
        assert!(e.is_leaf(), "clear_user: no page at {va}");
        self.set_entry(slot, e.with_perm(e.perm() - Perm::USER));
    }

    /// Release every table frame of this address space.
    ///
    /// # Panics
    /// If any leaf is still mapped; all user memory must be unmapped first.
    pub fn free_tables<A: FrameAlloc>(self, alloc: &A) {
        self.free_table(alloc, self.root, Level::L2);
    }

    fn free_table<A: FrameAlloc>(&self, alloc: &A, table: PhysicalPage<Size4K>, level: Level) {
        let t = unsafe { self.mapper.table_mut(table) };
        for i in 0..ENTRIES {
            let idx = TableIndex::new(i as u16);
            match t.get(idx).kind(level) {
                None => {}
                Some(EntryKind::PointerTable(child)) => {
                    if let Some(below) = level.next() {
                        self.free_table(alloc, child, below);
                    }
                    t.clear(idx);
                }
                Some(_) => panic!("free_tables: leaf left in {level} table {table}"),
            }
        }
        alloc.free_4k(table);
    }
}
