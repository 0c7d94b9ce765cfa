//! # Physical Page Allocator
//!
//! Bookkeeping for 4 KiB frames in one contiguous arena. Frames are numbered
//! by their index in the arena; free indices live on a stack, and a bitmap
//! catches double frees and frees of frames that were never handed out.
//!
//! This type never touches frame contents. Scrubbing on allocation and free
//! is done by [`Pmm`](crate::pmm::Pmm), outside the lock.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;

/// Free-index stack over `[base, base + frames * 4 KiB)`.
pub struct PageAllocator {
    base: PhysicalAddress,
    frames: u32,
    state: SpinLock<FreeFrames>,
}

struct FreeFrames {
    stack: Vec<u32>,
    /// One bit per frame, set while the frame is on the stack.
    free: Vec<u64>,
}

impl FreeFrames {
    fn is_free(&self, idx: u32) -> bool {
        self.free[(idx / 64) as usize] & (1 << (idx % 64)) != 0
    }

    fn set_free(&mut self, idx: u32, free: bool) {
        let word = &mut self.free[(idx / 64) as usize];
        if free {
            *word |= 1 << (idx % 64);
        } else {
            *word &= !(1 << (idx % 64));
        }
    }
}

impl PageAllocator {
    /// Arena over `[base, end)`. Every frame starts out **in use**; hand
    /// frames over with [`release`](Self::release).
    ///
    /// # Panics
    /// If `end` is below `base` or not page aligned.
    #[must_use]
    pub fn new(base: PhysicalPage<Size4K>, end: PhysicalAddress) -> Self {
        let base = base.base();
        assert!(end >= base, "page arena ends before it starts");
        assert!(end.is_aligned::<Size4K>(), "page arena end {end} not aligned");

        let frames = u32::try_from((end - base) / Size4K::SIZE)
            .unwrap_or_else(|_| panic!("page arena at {base} too large"));
        Self {
            base,
            frames,
            state: SpinLock::new(
                "kmem",
                FreeFrames {
                    stack: Vec::with_capacity(frames as usize),
                    free: vec![0; (frames as usize).div_ceil(64)],
                },
            ),
        }
    }

    /// Frames managed by the arena, free or not.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.frames as usize
    }

    /// `true` if `pa` lies inside the arena.
    #[inline]
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && (pa - self.base) / Size4K::SIZE < u64::from(self.frames)
    }

    /// Frames currently on the free stack.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.with_lock(|s| s.stack.len())
    }

    /// Pop a free frame, or `None` if the arena is exhausted.
    pub fn acquire(&self) -> Option<PhysicalPage<Size4K>> {
        let idx = self.state.with_lock(|s| {
            let idx = s.stack.pop()?;
            s.set_free(idx, false);
            Some(idx)
        })?;
        Some(self.frame(idx))
    }

    /// Push `frame` onto the free stack.
    ///
    /// # Panics
    /// If `frame` lies outside the arena or is already free.
    pub fn release(&self, frame: PhysicalPage<Size4K>) {
        let idx = self.index_of(frame);
        self.state.with_lock(|s| {
            assert!(!s.is_free(idx), "kfree: double free of {frame}");
            s.set_free(idx, true);
            s.stack.push(idx);
        });
    }

    /// Panic unless `frame` is an in-use frame of this arena.
    pub fn check_in_use(&self, frame: PhysicalPage<Size4K>) {
        let idx = self.index_of(frame);
        let free = self.state.with_lock(|s| s.is_free(idx));
        assert!(!free, "kfree: double free of {frame}");
    }

    fn index_of(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let pa = frame.base();
        assert!(
            self.contains(pa),
            "kfree: {pa} outside [{}, {})",
            self.base,
            self.base + u64::from(self.frames) * Size4K::SIZE
        );
        ((pa - self.base) / Size4K::SIZE) as u32
    }

    const fn frame(&self, idx: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(
            self.base.as_u64() + idx as u64 * Size4K::SIZE,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(frames: u64) -> PageAllocator {
        let base = PhysicalAddress::new(0x8020_0000);
        PageAllocator::new(base.page(), base + frames * Size4K::SIZE)
    }

    #[test]
    fn starts_with_nothing_free() {
        let pages = arena(16);
        assert_eq!(pages.capacity(), 16);
        assert_eq!(pages.free_count(), 0);
        assert_eq!(pages.acquire(), None);
    }

    #[test]
    fn released_frames_come_back_last_in_first_out() {
        let pages = arena(16);
        let a = PhysicalAddress::new(0x8020_0000).page();
        let b = PhysicalAddress::new(0x8020_3000).page();
        pages.release(a);
        pages.release(b);
        assert_eq!(pages.free_count(), 2);

        assert_eq!(pages.acquire(), Some(b));
        assert_eq!(pages.acquire(), Some(a));
        assert_eq!(pages.acquire(), None);
    }

    #[test]
    fn contains_covers_exactly_the_arena() {
        let pages = arena(4);
        assert!(pages.contains(PhysicalAddress::new(0x8020_0000)));
        assert!(pages.contains(PhysicalAddress::new(0x8020_3FFF)));
        assert!(!pages.contains(PhysicalAddress::new(0x8020_4000)));
        assert!(!pages.contains(PhysicalAddress::new(0x801F_F000)));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pages = arena(4);
        let a = PhysicalAddress::new(0x8020_1000).page();
        pages.release(a);
        pages.release(a);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn foreign_frame_panics() {
        let pages = arena(4);
        pages.release(PhysicalAddress::new(0x9000_0000).page());
    }

    #[test]
    fn check_in_use_accepts_allocated_frames() {
        let pages = arena(4);
        let a = PhysicalAddress::new(0x8020_1000).page();
        pages.check_in_use(a);
        pages.release(a);
        let got = pages.acquire().unwrap();
        pages.check_in_use(got);
    }
}
