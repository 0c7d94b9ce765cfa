//! # Kernel synchronization primitives
//!
//! The physical allocators keep their free stacks behind a [`SpinLock`].
//! Critical sections are a single push or pop and never nest with
//! page-table mutation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
