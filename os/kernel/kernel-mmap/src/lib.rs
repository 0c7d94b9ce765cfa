//! # Process Memory and File Mappings
//!
//! Ties one user page table to the two things a process grows it with:
//!
//! - the heap watermark, moved by [`ProcessMemory::sbrk`] either eagerly
//!   or lazily (pages appear on first touch);
//! - a fixed table of file-backed [`Vma`]s created by
//!   [`ProcessMemory::map_region`] and cut back by
//!   [`ProcessMemory::unmap_region`].
//!
//! ```text
//! 0                size          vma 0        vma 1            TRAPFRAME
//! │ heap (grow/shrink) │ (gap)  │ file pages │ … │ file pages │  (reserved) │
//! ```
//!
//! Mapped regions are placed above the heap and above every region already
//! in use, so the heap can never grow into them. Their pages are allocated
//! on the first fault and filled from the file; shared regions write dirty
//! data back when they are unmapped.
//!
//! Files are reached through the [`BackingFile`] trait; the file system
//! that implements it lives elsewhere.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod file;
pub mod process;
pub mod vma;

pub use file::{BackingFile, FileError, Transaction};
pub use process::{MmapError, ProcessMemory, SbrkMode};
pub use vma::{Prot, Sharing, Vma, VmaTable};
