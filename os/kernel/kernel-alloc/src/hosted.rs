//! # Hosted Physical Memory
//!
//! Lets the allocators and address-space code run as an ordinary process:
//! a [`HostRegion`] is a 2 MiB-aligned heap block whose addresses stand in
//! for physical addresses, and [`DirectMap`] maps them back 1:1.

use crate::pmm::PhysicalLayout;
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use core::ptr::NonNull;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M};
use kernel_vmem::PhysMapper;

/// Identity mapper over exposed host addresses.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectMap;

impl PhysMapper for DirectMap {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(pa.as_u64() as usize)
    }
}

/// Superpage-aligned block of host memory posing as RAM.
pub struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostRegion {
    /// Allocate `bytes` of zeroed memory aligned to 2 MiB.
    ///
    /// # Panics
    /// If `bytes` is zero or not a multiple of 2 MiB.
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        assert!(
            bytes != 0 && (bytes as u64).is_multiple_of(Size2M::SIZE),
            "host region of {bytes:#x} bytes"
        );
        let Ok(layout) = Layout::from_size_align(bytes, Size2M::SIZE as usize) else {
            panic!("host region of {bytes:#x} bytes");
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }

    #[must_use]
    pub fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.ptr.as_ptr().expose_provenance() as u64)
    }

    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.start() + self.layout.size() as u64
    }

    /// The whole region as RAM, with a pool of `superpages` at its start.
    #[must_use]
    pub fn layout(&self, superpages: usize) -> PhysicalLayout {
        PhysicalLayout {
            kernel_end: self.start(),
            phys_top: self.end(),
            superpages,
        }
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
