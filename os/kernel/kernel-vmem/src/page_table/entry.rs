//! # Sv39 Page-Table Entry
//!
//! One 64-bit layout serves every level:
//!
//! ```text
//! | 63‒54 | 53‒10 | 9‒8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//! |  res  |  PPN  | RSW | D | A | G | U | X | W | R | V |
//! ```
//!
//! An entry with `V=1` and none of `R|W|X` points at the next table. Any of
//! `R|W|X` makes it a leaf; the level holding it decides the mapped size.
//! [`PageTableEntry::kind`] decodes an entry *together with its level* into
//! an [`EntryKind`], so nobody has to remember which walk produced it.

use crate::page_table::Level;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K};

bitflags::bitflags! {
    /// Leaf permission and status bits, at their hardware positions.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: u64 {
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        /// Accessible from U-mode.
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl Perm {
    /// Bits that turn a valid entry into a leaf.
    pub const LEAF: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);
    /// Full user read/write access.
    pub const USER_RW: Self = Self::READ.union(Self::WRITE).union(Self::USER);
}

/// Sv39 page-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Valid (bit 0).
    pub valid: bool,
    /// Readable (bit 1).
    pub readable: bool,
    /// Writable (bit 2).
    pub writable: bool,
    /// Executable (bit 3).
    pub executable: bool,
    /// User accessible (bit 4).
    pub user: bool,
    /// Global mapping (bit 5).
    pub global: bool,
    /// Accessed (bit 6).
    pub accessed: bool,
    /// Dirty (bit 7).
    pub dirty: bool,
    /// Reserved for supervisor software (bits 8..9).
    #[bits(2)]
    pub rsw: u8,
    /// Physical page number (bits 10..53).
    #[bits(44)]
    ppn: u64,
    #[bits(10)]
    __reserved: u16,
}

/// Decoded meaning of a valid entry at a known level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Points at the next-level table.
    PointerTable(PhysicalPage<Size4K>),
    /// Level-0 leaf mapping one 4 KiB page.
    NormalLeaf(PhysicalPage<Size4K>, Perm),
    /// Level-1 leaf mapping one 2 MiB superpage.
    LargeLeaf(PhysicalPage<Size2M>, Perm),
}

impl PageTableEntry {
    /// Invalid entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Pointer to the next-level table at `table`.
    #[inline]
    #[must_use]
    pub const fn pointer(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_valid(true)
            .with_ppn(table.base().as_u64() >> 12)
    }

    /// Level-0 leaf for one 4 KiB page.
    #[inline]
    #[must_use]
    pub const fn page(frame: PhysicalPage<Size4K>, perm: Perm) -> Self {
        Self::leaf(frame.base(), perm)
    }

    /// Level-1 leaf for one 2 MiB superpage.
    #[inline]
    #[must_use]
    pub const fn superpage(extent: PhysicalPage<Size2M>, perm: Perm) -> Self {
        Self::leaf(extent.base(), perm)
    }

    const fn leaf(pa: PhysicalAddress, perm: Perm) -> Self {
        debug_assert!(perm.intersects(Perm::LEAF), "leaf without R/W/X");
        let bits = Self::pointer(pa.page::<Size4K>()).into_bits() | perm.bits();
        Self::from_bits(bits)
    }

    /// Physical address encoded in the PPN field.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.ppn() << 12)
    }

    /// Permission and status bits.
    #[inline]
    #[must_use]
    pub const fn perm(self) -> Perm {
        Perm::from_bits_truncate(self.into_bits())
    }

    /// Valid and carrying any of `R|W|X`.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.valid() && self.perm().intersects(Perm::LEAF)
    }

    /// Same entry with `perm` replacing the permission bits.
    #[inline]
    #[must_use]
    pub const fn with_perm(self, perm: Perm) -> Self {
        let bits = self.into_bits() & !Perm::all().bits();
        Self::from_bits(bits | perm.bits())
    }

    /// Decode a valid entry read from a table at `level`; `None` if invalid.
    ///
    /// # Panics
    /// On shapes this kernel never creates: a level-2 leaf (1 GiB page), a
    /// pointer at level 0, or a misaligned superpage.
    #[must_use]
    pub fn kind(self, level: Level) -> Option<EntryKind> {
        if !self.valid() {
            return None;
        }

        let pa = self.address();
        Some(match (level, self.is_leaf()) {
            (Level::L2 | Level::L1, false) => EntryKind::PointerTable(pa.page()),
            (Level::L1, true) => match PhysicalPage::<Size2M>::from_aligned(pa) {
                Some(extent) => EntryKind::LargeLeaf(extent, self.perm()),
                None => panic!("superpage leaf at misaligned {pa}"),
            },
            (Level::L0, true) => EntryKind::NormalLeaf(pa.page(), self.perm()),
            (Level::L2, true) => panic!("unexpected level-2 leaf ({pa})"),
            (Level::L0, false) => panic!("pointer entry at level 0 ({pa})"),
        })
    }
}
