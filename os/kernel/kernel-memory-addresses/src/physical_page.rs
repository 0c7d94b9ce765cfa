use crate::{PageSize, PhysicalAddress, Size2M, Size4K};
use core::fmt;
use core::marker::PhantomData;

/// Physical page base for size `S`.
///
/// A `PhysicalPage<S>` is the **page-aligned base** of a physical page of
/// size `S` (`S::SIZE` bytes). The low `S::SHIFT` bits are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x8123_4567);
/// let pp = pa.page::<Size2M>();
/// assert_eq!(pp.base().as_u64(), 0x8120_0000);
/// assert_eq!(pp.join(pa.offset::<Size2M>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.as_u64() & !S::OFFSET_MASK,
            _size: PhantomData,
        }
    }

    /// The page starting exactly at `pa`, or `None` if `pa` is not `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(pa: PhysicalAddress) -> Option<Self> {
        if pa.is_aligned::<S>() {
            Some(Self::from_addr(pa))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Combine with an in-page offset (`off < S::SIZE`).
    #[inline]
    #[must_use]
    pub const fn join(self, off: u64) -> PhysicalAddress {
        debug_assert!(off < S::SIZE);
        PhysicalAddress::new(self.base + off)
    }
}

impl PhysicalPage<Size2M> {
    /// The 512 constituent 4 KiB frames of this superpage, in address order.
    pub fn frames(self) -> impl Iterator<Item = PhysicalPage<Size4K>> {
        (0..Size2M::SIZE / Size4K::SIZE)
            .map(move |i| PhysicalPage::from_addr(PhysicalAddress::new(self.base + i * Size4K::SIZE)))
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::as_str(), self.base)
    }
}
