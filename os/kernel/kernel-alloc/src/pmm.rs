//! # Physical Memory Manager
//!
//! Bundles the 4 KiB page allocator, the superpage pool and the physical
//! mapper into one object that is built once at boot and then passed by
//! reference to every address-space operation.
//!
//! ```text
//! kernel_end  pool_start                 pool_end                 phys_top
//!     │ (gap) │ superpage 0 │ … │ sp N-1 │  4 KiB frames ……………………… │
//!             └───────── page arena (frames accepted by free_4k) ───┘
//! ```
//!
//! Only `[pool_end, phys_top)` starts out on the page free stack. Frames of
//! the pool become page-allocator frames once their superpage is split.

use crate::page_alloc::PageAllocator;
use crate::superpage::{ExtentState, SuperpageAllocator};
use kernel_info::memory::{FILL_ALLOCATED, FILL_FREED, NSUPERPAGES, PHYSTOP};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, align_up,
};
use kernel_vmem::{FrameAlloc, PhysMapper, SuperpageAlloc};

/// Physical memory handed to [`Pmm::init`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalLayout {
    /// First byte after the kernel image.
    pub kernel_end: PhysicalAddress,
    /// One past the last usable byte of RAM.
    pub phys_top: PhysicalAddress,
    /// Superpages to reserve.
    pub superpages: usize,
}

impl PhysicalLayout {
    /// The boot layout: RAM up to `PHYSTOP`, `NSUPERPAGES` superpages.
    #[must_use]
    pub const fn boot(kernel_end: PhysicalAddress) -> Self {
        Self {
            kernel_end,
            phys_top: PhysicalAddress::new(PHYSTOP),
            superpages: NSUPERPAGES,
        }
    }
}

/// Snapshot of allocator occupancy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryStats {
    pub free_pages: usize,
    pub free_superpages: usize,
    pub split_superpages: usize,
}

/// Physical memory manager.
pub struct Pmm<M: PhysMapper> {
    mapper: M,
    pages: PageAllocator,
    superpages: SuperpageAllocator,
}

impl<M: PhysMapper> Pmm<M> {
    /// Reserve the superpage pool right after `kernel_end` (rounded up to
    /// 2 MiB) and free every page frame above it.
    ///
    /// # Safety
    /// `[kernel_end, phys_top)` must be otherwise unused RAM, reachable and
    /// writable through `mapper`, and owned by the returned manager.
    ///
    /// # Panics
    /// If the pool does not fit below `phys_top`.
    pub unsafe fn init(mapper: M, layout: PhysicalLayout) -> Self {
        let pool_start = PhysicalAddress::new(align_up(layout.kernel_end.as_u64(), Size2M::SIZE));
        let superpages = SuperpageAllocator::reserve(pool_start.page(), layout.superpages);
        let pool_end = superpages.end();
        assert!(
            pool_end <= layout.phys_top,
            "kinit: superpage pool ends at {pool_end}, beyond {}",
            layout.phys_top
        );

        let phys_top = PhysicalAddress::new(layout.phys_top.as_u64() & !Size4K::OFFSET_MASK);
        let pages = PageAllocator::new(pool_start.page(), phys_top);
        let mut frame = pool_end;
        while frame < phys_top {
            let page = frame.page::<Size4K>();
            unsafe { mapper.fill(page, FILL_FREED) };
            pages.release(page);
            frame += Size4K::SIZE;
        }

        log::debug!(
            "kinit: {} superpages at {pool_start}, {} pages up to {phys_top}",
            superpages.capacity(),
            pages.free_count()
        );
        Self {
            mapper,
            pages,
            superpages,
        }
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    pub const fn superpages(&self) -> &SuperpageAllocator {
        &self.superpages
    }

    #[inline]
    pub const fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    /// Retire a superpage that demotion turned into 512 normal pages.
    pub fn split_superpage(&self, extent: PhysicalPage<Size2M>) {
        self.superpages.split(extent);
        log::debug!(
            "split {extent}; {} of {} superpages left in the pool",
            self.superpages.free_count(),
            self.superpages.capacity() - self.superpages.split_count()
        );
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            free_pages: self.pages.free_count(),
            free_superpages: self.superpages.free_count(),
            split_superpages: self.superpages.split_count(),
        }
    }
}

impl<M: PhysMapper> FrameAlloc for Pmm<M> {
    /// Pop a frame and fill it with junk.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let Some(frame) = self.pages.acquire() else {
            log::warn!("kalloc: out of pages");
            return None;
        };
        unsafe { self.mapper.fill(frame, FILL_ALLOCATED) };
        Some(frame)
    }

    /// Scrub `frame` and push it back.
    ///
    /// # Panics
    /// If `frame` is outside the arena, already free, or part of a pool
    /// superpage that has not been split.
    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        if self.superpages.contains(frame.base()) {
            let state = self.superpages.state_of(frame.base());
            assert_eq!(state, ExtentState::Split, "kfree: {frame} belongs to a {state} superpage");
        }
        self.pages.check_in_use(frame);
        unsafe { self.mapper.fill(frame, FILL_FREED) };
        self.pages.release(frame);
    }
}

impl<M: PhysMapper> SuperpageAlloc for Pmm<M> {
    /// Pop an extent and zero it.
    fn alloc_2m(&self) -> Option<PhysicalPage<Size2M>> {
        let extent = self.superpages.acquire()?;
        unsafe { self.mapper.fill(extent, 0) };
        log::trace!("superalloc {extent}");
        Some(extent)
    }

    fn free_2m(&self, extent: PhysicalPage<Size2M>) {
        self.superpages.check_allocated(extent);
        unsafe { self.mapper.fill(extent, FILL_FREED) };
        self.superpages.release(extent);
        log::trace!("superfree {extent}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{DirectMap, HostRegion};

    const MIB: usize = 1 << 20;

    fn pmm(region: &HostRegion, superpages: usize) -> Pmm<DirectMap> {
        unsafe { Pmm::init(DirectMap, region.layout(superpages)) }
    }

    fn byte_at(pa: PhysicalAddress) -> u8 {
        unsafe { *DirectMap.phys_to_ptr(pa) }
    }

    #[test]
    fn pool_sits_at_the_region_start() {
        let region = HostRegion::new(8 * MIB);
        let pmm = pmm(&region, 2);
        assert_eq!(pmm.superpages().start(), region.start());
        assert_eq!(pmm.stats(), MemoryStats {
            free_pages: 4 * MIB / 4096,
            free_superpages: 2,
            split_superpages: 0,
        });
    }

    #[test]
    fn pages_are_filled_on_alloc_and_free() {
        let region = HostRegion::new(4 * MIB);
        let pmm = pmm(&region, 1);

        let frame = pmm.alloc_4k().unwrap();
        assert!(frame.base() >= pmm.superpages().end());
        assert_eq!(byte_at(frame.base()), FILL_ALLOCATED);
        assert_eq!(byte_at(frame.base() + 4095), FILL_ALLOCATED);

        pmm.free_4k(frame);
        assert_eq!(byte_at(frame.base() + 17), FILL_FREED);
    }

    #[test]
    fn superpages_are_zeroed_then_scrubbed() {
        let region = HostRegion::new(4 * MIB);
        let pmm = pmm(&region, 1);

        let extent = pmm.alloc_2m().unwrap();
        assert!(extent.base().is_aligned::<Size2M>());
        assert_eq!(byte_at(extent.base() + 0x1F_FFFF), 0);
        assert_eq!(pmm.alloc_2m(), None);

        pmm.free_2m(extent);
        assert_eq!(byte_at(extent.base() + 0x1234), FILL_FREED);
        assert_eq!(pmm.stats().free_superpages, 1);
    }

    #[test]
    fn split_superpage_frames_join_the_page_allocator() {
        let region = HostRegion::new(4 * MIB);
        let pmm = pmm(&region, 1);
        let before = pmm.stats().free_pages;

        let extent = pmm.alloc_2m().unwrap();
        pmm.split_superpage(extent);
        for frame in extent.frames() {
            pmm.free_4k(frame);
        }

        let stats = pmm.stats();
        assert_eq!(stats.free_pages, before + 512);
        assert_eq!(stats.free_superpages, 0);
        assert_eq!(stats.split_superpages, 1);
    }

    #[test]
    #[should_panic(expected = "allocated superpage")]
    fn freeing_a_frame_of_a_live_superpage_panics() {
        let region = HostRegion::new(4 * MIB);
        let pmm = pmm(&region, 1);
        let extent = pmm.alloc_2m().unwrap();
        pmm.free_4k(extent.frames().next().unwrap());
    }

    #[test]
    #[should_panic(expected = "kinit")]
    fn pool_must_fit_in_ram() {
        let region = HostRegion::new(4 * MIB);
        let _ = pmm(&region, 3);
    }
}
