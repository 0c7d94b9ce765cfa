//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size2M, Size4K};

/// Base page size in bytes.
pub const PGSIZE: u64 = Size4K::SIZE;

/// Superpage size in bytes.
pub const SUPERPGSIZE: u64 = Size2M::SIZE;

/// Physical address at which the kernel image is loaded (QEMU `virt` RAM base).
pub const KERNBASE: u64 = 0x8000_0000;

/// End of usable physical RAM.
pub const PHYSTOP: u64 = KERNBASE + 128 * 1024 * 1024;

/// One beyond the highest user virtual address.
///
/// Sv39 allows 39 bits, but one bit less avoids having to sign-extend
/// virtual addresses that have the high bit set.
pub const MAXVA: u64 = 1 << (9 + 9 + 9 + 12 - 1);

/// Trampoline page, mapped read-execute at the top of every address space.
pub const TRAMPOLINE: u64 = MAXVA - PGSIZE;

/// Per-process trap context, directly below the trampoline.
pub const TRAPFRAME: u64 = TRAMPOLINE - PGSIZE;

/// Exclusive upper bound for heap growth and mapped regions.
pub const USER_TOP: u64 = TRAPFRAME;

/// Number of 2 MiB extents reserved for the superpage pool at boot.
pub const NSUPERPAGES: usize = 8;

/// Mapped-region slots per process.
pub const NVMA: usize = 16;

/// Byte written over every freed page or superpage.
pub const FILL_FREED: u8 = 0x01;

/// Byte written over a freshly allocated 4 KiB page.
pub const FILL_ALLOCATED: u8 = 0x05;

const _: () = {
    assert!(PHYSTOP > KERNBASE);
    assert!(PHYSTOP.is_multiple_of(SUPERPGSIZE));
    assert!(USER_TOP.is_multiple_of(PGSIZE));
    assert!(TRAPFRAME < TRAMPOLINE && TRAMPOLINE < MAXVA);
    assert!((NSUPERPAGES as u64) * SUPERPGSIZE < PHYSTOP - KERNBASE);
    assert!(NVMA > 0);
};
