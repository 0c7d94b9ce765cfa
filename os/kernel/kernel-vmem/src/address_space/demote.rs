//! # Superpage Demotion
//!
//! Replaces one level-1 superpage leaf with a level-0 table of 512 normal
//! leaves that map the same frames with the same permissions. Observable
//! memory does not change.
//!
//! The work happens under a [`Demotion`] guard: if a table frame cannot be
//! allocated part-way, dropping the guard removes what was installed and
//! puts the original superpage entry back.

use super::{AddressSpace, LargeSlot, MapError};
use crate::FrameAlloc;
use crate::PhysMapper;
use crate::page_table::{EntryKind, PageTableEntry};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size2M, Size4K, VirtualAddress};

impl<M: PhysMapper> AddressSpace<'_, M> {
    /// Split the superpage leaf at `va` into 512 normal leaves.
    ///
    /// Returns the extent the superpage mapped; its frames are now mapped
    /// one by one.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the level-0 table cannot be allocated.
    /// The superpage mapping is then exactly as before the call.
    ///
    /// # Panics
    /// If `va` is not 2 MiB aligned or no superpage leaf maps it.
    pub fn demote<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size2M>, MapError> {
        assert!(va.is_aligned::<Size2M>(), "demote: {va} not superpage aligned");

        let slot = self
            .walk_large(va)
            .unwrap_or_else(|| panic!("demote: no level-1 table for {va}"));
        let original = self.entry(slot);
        let Some(EntryKind::LargeLeaf(extent, perm)) = self.kind(slot) else {
            panic!("demote: {va} is not a superpage");
        };

        self.set_entry(slot, PageTableEntry::zero());
        let mut demotion = Demotion {
            aspace: self,
            alloc,
            slot,
            original,
            base: va,
            installed: 0,
            committed: false,
        };

        for frame in extent.frames() {
            let page_va = va + demotion.installed * Size4K::SIZE;
            self.map_pages(alloc, page_va, Size4K::SIZE, frame.base(), perm)?;
            demotion.installed += 1;
        }

        demotion.commit();
        log::trace!("demoted {extent} at {va}");
        Ok(extent)
    }
}

/// In-flight demotion; restores the superpage unless committed.
struct Demotion<'a, 'm, M: PhysMapper, A: FrameAlloc> {
    aspace: &'a AddressSpace<'m, M>,
    alloc: &'a A,
    slot: LargeSlot,
    original: PageTableEntry,
    base: VirtualAddress,
    installed: u64,
    committed: bool,
}

impl<M: PhysMapper, A: FrameAlloc> Demotion<'_, '_, M, A> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<M: PhysMapper, A: FrameAlloc> Drop for Demotion<'_, '_, M, A> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for i in 0..self.installed {
            self.aspace.unmap_page(self.base + i * Size4K::SIZE);
        }
        // The slot held a leaf before, so any table in it now is ours.
        if let Some(EntryKind::PointerTable(table)) = self.aspace.kind(self.slot) {
            self.aspace.set_entry(self.slot, PageTableEntry::zero());
            self.alloc.free_4k(table);
        }
        self.aspace.set_entry(self.slot, self.original);
        log::warn!("demotion of {} rolled back", self.base);
    }
}
