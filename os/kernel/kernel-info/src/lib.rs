//! # Kernel Memory Configuration
//!
//! Single source of truth for the address-space layout and the memory
//! tunables shared by the page-table code, the physical allocators and the
//! mapped-region manager.
//!
//! ## User Address Space (Sv39)
//!
//! ```text
//! MAXVA       ┌─────────────────────────────────┐ 0x40_0000_0000
//!             │  Trampoline (R-X, shared)       │
//! TRAMPOLINE  ├─────────────────────────────────┤
//!             │  Trap frame (per process)       │
//! TRAPFRAME   ├─────────────────────────────────┤ = USER_TOP
//!             │                                 │
//!             │  Mapped regions (VMAs)          │
//!             │  placed above the heap          │
//!             │                                 │
//! size        ├─────────────────────────────────┤
//!             │  Heap / text / data / stack     │
//!             │  (4 KiB pages, 2 MiB superpages)│
//! 0x0         └─────────────────────────────────┘
//! ```
//!
//! Both reserved pages are installed by the trap code; nothing in the
//! memory core may map at or above [`USER_TOP`](memory::USER_TOP).
//!
//! ## Physical Memory
//!
//! ```text
//! KERNBASE    ┌─────────────────────────────────┐ 0x8000_0000
//!             │  Kernel image                   │
//! end         ├─────────────────────────────────┤
//!             │  (padding to 2 MiB)             │
//!             ├─────────────────────────────────┤
//!             │  Superpage pool                 │
//!             │  NSUPERPAGES × 2 MiB            │
//!             ├─────────────────────────────────┤
//!             │  4 KiB page allocator           │
//! PHYSTOP     └─────────────────────────────────┘
//! ```
//!
//! All values are `const` and validated by compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
