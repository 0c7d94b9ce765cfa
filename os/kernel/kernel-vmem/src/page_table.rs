//! # Sv39 Page Table

pub mod entry;

use core::fmt;
use kernel_memory_addresses::VirtualAddress;

pub use entry::{EntryKind, PageTableEntry, Perm};

/// Entries per table.
pub const ENTRIES: usize = 512;

/// Table level, counted from the leaves.
///
/// | Level | VA bits | Leaf size |
/// |:------|:--------|:----------|
/// | `L2`  | 38‒30   | never used as leaf |
/// | `L1`  | 29‒21   | 2 MiB |
/// | `L0`  | 20‒12   | 4 KiB |
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    L0,
    L1,
    L2,
}

impl Level {
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * self as u32
    }

    /// Slot for `va` in a table of this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level below, or `None` at the leaves.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L2 => Some(Self::L1),
            Self::L1 => Some(Self::L0),
            Self::L0 => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", *self as u8)
    }
}

/// Index into one table (`0..512`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One 4 KiB-aligned table of 512 entries, valid at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    /// Fully invalid table.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// Read the entry at `i`. Plain load; no TLB synchronization implied.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Callers changing an active address space must issue `sfence.vma`.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn clear(&mut self, i: TableIndex) {
        self.set(i, PageTableEntry::zero());
    }

    /// `true` if no entry is valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.valid())
    }

    /// Valid entries with their indices.
    pub fn valid_entries(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid())
            .map(|(i, e)| (TableIndex::new(i as u16), *e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_sv39_address() {
        let va = VirtualAddress::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(Level::L2.index_of(va).as_usize(), 3);
        assert_eq!(Level::L1.index_of(va).as_usize(), 5);
        assert_eq!(Level::L0.index_of(va).as_usize(), 7);
        assert_eq!(Level::L2.next(), Some(Level::L1));
        assert_eq!(Level::L0.next(), None);
    }

    #[test]
    fn table_is_one_page() {
        assert_eq!(size_of::<PageTable>(), 4096);
        assert_eq!(align_of::<PageTable>(), 4096);
    }

    #[test]
    fn valid_entries_skips_holes() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        let frame = kernel_memory_addresses::PhysicalAddress::new(0x8000_1000).page();
        t.set(TableIndex::new(9), PageTableEntry::page(frame, Perm::READ));
        let found: Vec<_> = t.valid_entries().map(|(i, _)| i.as_usize()).collect();
        assert_eq!(found, vec![9]);
        t.clear(TableIndex::new(9));
        assert!(t.is_empty());
    }
}
