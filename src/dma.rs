//! DMA memory for hardware descriptors
//!
//! The controller reads and writes queue heads and transfer descriptors by
//! DMA, so they come from a dedicated allocator rather than the stack or a
//! heap. Memory is identity mapped: the physical address handed to the
//! controller is the address of the Rust object.

pub mod pools;

pub use pools::{DescriptorAllocator, DescriptorPool, PoolStats, QhHandle, QtdHandle};

/// Page size the EHCI buffer pointers are expressed in
pub const PAGE_SIZE: usize = 4096;

/// DMA alignment requirement for queue heads and transfer descriptors
pub const DMA_ALIGNMENT: usize = 32;

/// Check if address is properly aligned for descriptor DMA
#[inline(always)]
pub const fn is_dma_aligned(addr: usize) -> bool {
    addr & (DMA_ALIGNMENT - 1) == 0
}

/// Offset of a physical address within its page
#[inline(always)]
pub const fn page_offset(physical: u32) -> u32 {
    physical & (PAGE_SIZE as u32 - 1)
}
