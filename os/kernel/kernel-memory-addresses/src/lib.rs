//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! Sv39 paging code.
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] | User virtual memory, translated by the page tables. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical RAM. |
//!
//! ## Page Sizes
//!
//! Two granularities exist, selected by marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (level-0 leaves)
//! - [`Size2M`]: 2 MiB superpages (level-1 leaves)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0x0040_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//!
//! let sp = PhysicalAddress::new(0x8040_0000).page::<Size2M>();
//! assert_eq!(sp.frames().count() as u64, PAGES_PER_SUPERPAGE);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64` and implement `Copy`, `Eq`,
//! `Ord` and `Hash`. The phantom marker `S` fixes the page size at the type
//! level so that a 4 KiB frame can never be handed to a 2 MiB consumer.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use page_size::{PAGES_PER_SUPERPAGE, PageSize, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x3f_ffff, 0x20_0000), 0x20_0000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// assert_eq!(align_up(0x1000, 0x20_0000), 0x20_0000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Round a byte count up to a whole number of `S` pages.
#[inline]
#[must_use]
pub const fn page_round_up<S: PageSize>(x: u64) -> u64 {
    align_up(x, S::SIZE)
}

/// Round a byte count down to a whole number of `S` pages.
#[inline]
#[must_use]
pub const fn page_round_down<S: PageSize>(x: u64) -> u64 {
    align_down(x, S::SIZE)
}
