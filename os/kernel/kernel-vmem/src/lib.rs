//! # Virtual Memory Support
//!
//! Sv39 paging for user address spaces with two leaf granularities.
//!
//! ## What you get
//! - An [`address space`](address_space) rooted at one level-2 table, with
//!   walkers, mapping helpers, translation and teardown.
//! - A superpage [demotion](AddressSpace::demote) that splits one 2 MiB leaf
//!   into 512 equivalent 4 KiB leaves and rolls back on failure.
//! - The Sv39 [`PageTableEntry`], its leaf [`Perm`] bits, and the per-level
//!   decoded view [`EntryKind`].
//! - The allocator/mapper seams ([`FrameAlloc`], [`SuperpageAlloc`], [`PhysMapper`]).
//!
//! ## Sv39 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! ```text
//!  L2  →  L1  →  L0  →  4 KiB page
//!          │
//!          └──────────►  2 MiB superpage (leaf one level early)
//! ```
//!
//! | Level | Entry meaning when `V=1` and `R|W|X = 0` | Entry meaning with any of `R|W|X` |
//! |:------|:------------------------------------------|:----------------------------------|
//! | L2    | pointer to an L1 table                    | (1 GiB page; never created)       |
//! | L1    | pointer to an L0 table                    | 2 MiB superpage                   |
//! | L0    | (invalid)                                 | 4 KiB page                        |
//!
//! The bit layout is identical at every level; only the level tells a normal
//! leaf from a superpage leaf. The walkers therefore hand out typed slots
//! ([`LeafSlot`], [`LargeSlot`]) that remember their level.
//!
//! Addresses at or above [`MAXVA`](kernel_info::memory::MAXVA) are rejected.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

pub mod address_space;
pub mod page_table;

extern crate alloc;

pub use crate::address_space::{AddressSpace, LargeSlot, LeafSlot, MapError, Slot};
pub use crate::page_table::{EntryKind, Level, PageTable, PageTableEntry, Perm};
pub use kernel_memory_addresses as addresses;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K};

/// Source of **physical** 4 KiB frames for page tables and user pages.
///
/// Implementations synchronize internally; every method takes `&self` so one
/// allocator can serve many address spaces at once.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Contents are unspecified; callers zero it.
    ///
    /// Returns `None` on out-of-memory.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, page: PhysicalPage<Size4K>);
}

/// Source of naturally aligned 2 MiB physical extents.
pub trait SuperpageAlloc {
    /// Allocate one zero-filled superpage, or `None` if the pool is empty.
    fn alloc_2m(&self) -> Option<PhysicalPage<Size2M>>;

    /// Return an extent obtained from [`alloc_2m`](Self::alloc_2m).
    fn free_2m(&self, extent: PhysicalPage<Size2M>);
}

/// Converts physical addresses to usable pointers in the current address
/// space (identity map in the kernel, a heap window in hosted tests).
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The mapping must remain valid for `'a`.
    /// - No other live reference may alias the same bytes.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// The page table stored in `page`.
    ///
    /// # Safety
    /// `page` must hold a page table owned by the caller's address space.
    #[inline]
    unsafe fn table_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    /// The bytes of one page.
    ///
    /// # Safety
    /// The caller must own `page` and hold no other reference into it.
    #[inline]
    unsafe fn page_bytes<'a, S: PageSize>(&self, page: PhysicalPage<S>) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(page.base()), S::SIZE as usize) }
    }

    /// Overwrite a whole page with `byte`.
    ///
    /// # Safety
    /// The caller must own `page`.
    #[inline]
    unsafe fn fill<S: PageSize>(&self, page: PhysicalPage<S>, byte: u8) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(page.base()), byte, S::SIZE as usize) }
    }

    /// Copy a whole page.
    ///
    /// # Safety
    /// Both pages must be valid and distinct; the caller must own `dst`.
    #[inline]
    unsafe fn copy_page<S: PageSize>(&self, src: PhysicalPage<S>, dst: PhysicalPage<S>) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src.base()),
                self.phys_to_ptr(dst.base()),
                S::SIZE as usize,
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    /// Logical physical base of the simulated RAM.
    pub const RAM_BASE: u64 = 0x8000_0000;

    /// A 4 KiB-aligned raw frame.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated RAM: `n` frames addressed from [`RAM_BASE`].
    pub struct TestPhys {
        frames: *mut Aligned4K,
        len: usize,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let v: Vec<Aligned4K> = (0..n).map(|_| Aligned4K([0; 4096])).collect();
            let frames = Box::into_raw(v.into_boxed_slice()).cast::<Aligned4K>();
            Self { frames, len: n }
        }

        pub fn read(&self, pa: u64) -> u8 {
            unsafe { *self.phys_to_ptr(PhysicalAddress::new(pa)) }
        }

        pub fn write(&self, pa: u64, byte: u8) {
            unsafe { *self.phys_to_ptr(PhysicalAddress::new(pa)) = byte }
        }
    }

    impl Drop for TestPhys {
        fn drop(&mut self) {
            let slice = core::ptr::slice_from_raw_parts_mut(self.frames, self.len);
            drop(unsafe { Box::from_raw(slice) });
        }
    }

    impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let off = (pa.as_u64() - RAM_BASE) as usize;
            assert!(off < self.len * 4096, "{pa} outside simulated RAM");
            unsafe { self.frames.cast::<u8>().add(off) }
        }
    }

    /// A **bump** allocator over frames `[next, end)` that also records frees.
    pub struct BumpAlloc {
        next: Cell<u64>,
        end: u64,
        pub freed: RefCell<Vec<PhysicalPage<Size4K>>>,
    }

    impl BumpAlloc {
        pub fn new(start: u64, end: u64) -> Self {
            Self {
                next: Cell::new(start),
                end,
                freed: RefCell::new(Vec::new()),
            }
        }

        /// Frames handed out so far minus frames returned.
        pub fn live(&self, start: u64) -> u64 {
            (self.next.get() - start) / 4096 - self.freed.borrow().len() as u64
        }

        /// Cut the allocator off: every later request fails.
        pub fn exhaust(&self) {
            self.next.set(self.end);
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
            let p = self.next.get();
            if p + 4096 > self.end {
                return None;
            }
            self.next.set(p + 4096);
            Some(PhysicalAddress::new(p).page())
        }

        fn free_4k(&self, page: PhysicalPage<Size4K>) {
            self.freed.borrow_mut().push(page);
        }
    }
}
