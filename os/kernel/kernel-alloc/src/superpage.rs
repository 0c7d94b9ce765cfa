//! # Superpage Pool
//!
//! A fixed number of naturally aligned 2 MiB extents, reserved once at boot
//! directly behind the kernel image. Extents are handed out whole and come
//! back whole, unless a demotion splits one into 512 frames that are owned
//! one by one from then on.
//!
//! ```text
//!   Free ──acquire──► Allocated ──release──► Free
//!                        │
//!                        └──split──► Split (retired for good)
//! ```

use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M};
use kernel_sync::SpinLock;

/// Where a pool extent is in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtentState {
    Free,
    Allocated,
    /// Demoted into normal pages; never returns to the pool.
    Split,
}

pub struct SuperpageAllocator {
    base: PhysicalAddress,
    count: usize,
    state: SpinLock<Pool>,
}

struct Pool {
    stack: Vec<u16>,
    extents: Vec<ExtentState>,
}

impl SuperpageAllocator {
    /// Reserve `count` extents starting at `base`; all start out free.
    ///
    /// # Panics
    /// If `count` does not fit the index type.
    #[must_use]
    pub fn reserve(base: PhysicalPage<Size2M>, count: usize) -> Self {
        let n = u16::try_from(count).unwrap_or_else(|_| panic!("superpage pool of {count} extents"));
        Self {
            base: base.base(),
            count,
            state: SpinLock::new(
                "superpages",
                Pool {
                    stack: (0..n).collect(),
                    extents: alloc::vec![ExtentState::Free; count],
                },
            ),
        }
    }

    /// First byte of the pool.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.base
    }

    /// One past the last byte of the pool.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.count as u64 * Size2M::SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.start() && pa < self.end()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.with_lock(|p| p.stack.len())
    }

    /// Extents permanently retired by [`split`](Self::split).
    #[must_use]
    pub fn split_count(&self) -> usize {
        self.state
            .with_lock(|p| p.extents.iter().filter(|s| **s == ExtentState::Split).count())
    }

    /// Lifecycle state of the extent containing `pa`.
    ///
    /// # Panics
    /// If `pa` is outside the pool.
    #[must_use]
    pub fn state_of(&self, pa: PhysicalAddress) -> ExtentState {
        let idx = self.index_of(pa, "superpage state");
        self.state.with_lock(|p| p.extents[idx])
    }

    /// Pop a free extent. Contents are unspecified; the caller zeroes it.
    pub fn acquire(&self) -> Option<PhysicalPage<Size2M>> {
        let idx = self.state.with_lock(|p| {
            let idx = usize::from(p.stack.pop()?);
            p.extents[idx] = ExtentState::Allocated;
            Some(idx)
        })?;
        Some(self.extent(idx))
    }

    /// Panic unless `extent` is currently allocated from this pool.
    pub fn check_allocated(&self, extent: PhysicalPage<Size2M>) {
        let idx = self.index_of(extent.base(), "superfree");
        let state = self.state.with_lock(|p| p.extents[idx]);
        assert_eq!(state, ExtentState::Allocated, "superfree: {extent} is {state}");
    }

    /// Return `extent` to the pool.
    ///
    /// # Panics
    /// If `extent` is outside the pool or not currently allocated.
    pub fn release(&self, extent: PhysicalPage<Size2M>) {
        let idx = self.index_of(extent.base(), "superfree");
        self.state.with_lock(|p| {
            let state = p.extents[idx];
            assert_eq!(state, ExtentState::Allocated, "superfree: {extent} is {state}");
            p.extents[idx] = ExtentState::Free;
            p.stack.push(idx as u16);
        });
    }

    /// Retire an allocated extent whose frames are now owned individually.
    ///
    /// # Panics
    /// If `extent` is outside the pool or not currently allocated.
    pub fn split(&self, extent: PhysicalPage<Size2M>) {
        let idx = self.index_of(extent.base(), "split");
        self.state.with_lock(|p| {
            let state = p.extents[idx];
            assert_eq!(state, ExtentState::Allocated, "split: {extent} is {state}");
            p.extents[idx] = ExtentState::Split;
        });
    }

    fn index_of(&self, pa: PhysicalAddress, op: &str) -> usize {
        assert!(
            self.contains(pa),
            "{op}: {pa} outside pool [{}, {})",
            self.start(),
            self.end()
        );
        ((pa - self.base) / Size2M::SIZE) as usize
    }

    fn extent(&self, idx: usize) -> PhysicalPage<Size2M> {
        PhysicalPage::from_addr(self.base + idx as u64 * Size2M::SIZE)
    }
}

impl fmt::Display for ExtentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Allocated => "allocated",
            Self::Split => "split",
        })
    }
}
