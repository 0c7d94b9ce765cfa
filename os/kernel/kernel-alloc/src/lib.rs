//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical allocators and the user address-space mutator built on
//! `kernel-vmem`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │             Virtual Memory Manager (Vmm)            │
//! │    • grow / shrink / unmap / copy / free            │
//! │    • lazy-heap fault resolution                     │
//! │    • kernel ↔ user copies                           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc + SuperpageAlloc + PhysMapper
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Memory Manager (Pmm)             │
//! │    • 4 KiB page arena, free-index stack             │
//! │    • 2 MiB superpage pool, split accounting         │
//! │    • junk fills on alloc/free                       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! The [`Pmm`](pmm::Pmm) is constructed once and shared by reference; its two
//! free stacks are the only state shared between address spaces, each behind
//! its own [`SpinLock`](kernel_sync::SpinLock). A [`Vmm`](vmm::Vmm) owns one
//! page-table tree and is mutated through `&mut self` only.
//!
//! ## Hosted use
//!
//! With the `hosted` feature, [`hosted::HostRegion`] provides heap-backed
//! "physical" memory so the whole stack runs in ordinary unit tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;
pub mod page_alloc;
pub mod pmm;
pub mod superpage;
pub mod vmm;

pub use pmm::{MemoryStats, PhysicalLayout, Pmm};
pub use vmm::{FaultError, Vmm, VmmError};
