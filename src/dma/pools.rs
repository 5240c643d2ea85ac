//! Zero-allocation descriptor pools with compile-time sizing

use core::sync::atomic::{AtomicBool, Ordering};

use super::is_dma_aligned;
use crate::ehci::{QueueHead, QueueTD};

/// Handle to an allocated queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QhHandle {
    index: u16,
}

impl QhHandle {
    /// Wrap a pool index
    pub const fn new(index: u16) -> Self {
        Self { index }
    }

    /// Pool index
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

/// Handle to an allocated queue transfer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QtdHandle {
    index: u16,
}

impl QtdHandle {
    /// Wrap a pool index
    pub const fn new(index: u16) -> Self {
        Self { index }
    }

    /// Pool index
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

/// Source of DMA-visible descriptor memory
///
/// Blocks handed out must be 32-byte aligned, physically contiguous and
/// uncached (or kept coherent by the platform). Allocation and release may be
/// called from the interrupt-level paths of the controller, so methods take
/// `&self`.
pub trait DescriptorAllocator {
    /// Allocate a queue head, reset to an inert state
    fn alloc_queue_head(&self) -> Option<QhHandle>;

    /// Return a queue head to the pool
    fn free_queue_head(&self, handle: QhHandle);

    /// Access an allocated queue head
    fn queue_head(&self, handle: QhHandle) -> &QueueHead;

    /// Physical address of a queue head
    fn queue_head_physical(&self, handle: QhHandle) -> u32;

    /// Allocate a transfer descriptor, reset to a halted placeholder
    fn alloc_transfer_descriptor(&self) -> Option<QtdHandle>;

    /// Return a transfer descriptor to the pool
    fn free_transfer_descriptor(&self, handle: QtdHandle);

    /// Access an allocated transfer descriptor
    fn transfer_descriptor(&self, handle: QtdHandle) -> &QueueTD;

    /// Physical address of a transfer descriptor
    fn transfer_descriptor_physical(&self, handle: QtdHandle) -> u32;

    /// Find the transfer descriptor at a physical address
    fn transfer_descriptor_at(&self, physical: u32) -> Option<QtdHandle>;

    /// Find the queue head at a physical address
    fn queue_head_at(&self, physical: u32) -> Option<QhHandle>;

    /// Pool utilization
    fn stats(&self) -> PoolStats;
}

/// Memory pool for USB descriptors with compile-time sizing
pub struct DescriptorPool<const N_QH: usize, const N_QTD: usize> {
    queue_heads: [QueueHead; N_QH],
    transfer_descriptors: [QueueTD; N_QTD],
    qh_allocated: [AtomicBool; N_QH],
    qtd_allocated: [AtomicBool; N_QTD],
}

impl<const N_QH: usize, const N_QTD: usize> DescriptorPool<N_QH, N_QTD> {
    /// Create new descriptor pool (const-compatible)
    pub const fn new() -> Self {
        Self {
            queue_heads: [const { QueueHead::new() }; N_QH],
            transfer_descriptors: [const { QueueTD::new() }; N_QTD],
            qh_allocated: [const { AtomicBool::new(false) }; N_QH],
            qtd_allocated: [const { AtomicBool::new(false) }; N_QTD],
        }
    }

    fn claim(flags: &[AtomicBool]) -> Option<usize> {
        flags
            .iter()
            .position(|allocated| !allocated.swap(true, Ordering::Acquire))
    }

    fn release(flags: &[AtomicBool], index: usize) {
        if let Some(allocated) = flags.get(index) {
            let was_allocated = allocated.swap(false, Ordering::Release);
            debug_assert!(was_allocated, "descriptor {} freed twice", index);
        }
    }

    fn lookup<T>(items: &[T], physical: u32) -> Option<usize> {
        let base = items.as_ptr() as usize as u32;
        let offset = physical.wrapping_sub(base) as usize;
        let size = core::mem::size_of::<T>();
        if offset % size != 0 {
            return None;
        }

        let index = offset / size;
        (index < items.len()).then_some(index)
    }
}

impl<const N_QH: usize, const N_QTD: usize> Default for DescriptorPool<N_QH, N_QTD> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N_QH: usize, const N_QTD: usize> DescriptorAllocator for DescriptorPool<N_QH, N_QTD> {
    fn alloc_queue_head(&self) -> Option<QhHandle> {
        let Some(index) = Self::claim(&self.qh_allocated) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("QH pool exhausted - all {} queue heads allocated", N_QH);
            return None;
        };

        let handle = QhHandle::new(index as u16);
        debug_assert!(is_dma_aligned(self.queue_head_physical(handle) as usize));
        self.queue_heads[index].init_empty(0);
        Some(handle)
    }

    fn free_queue_head(&self, handle: QhHandle) {
        Self::release(&self.qh_allocated, handle.index());
    }

    fn queue_head(&self, handle: QhHandle) -> &QueueHead {
        &self.queue_heads[handle.index()]
    }

    fn queue_head_physical(&self, handle: QhHandle) -> u32 {
        &self.queue_heads[handle.index()] as *const QueueHead as usize as u32
    }

    fn alloc_transfer_descriptor(&self) -> Option<QtdHandle> {
        let Some(index) = Self::claim(&self.qtd_allocated) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("qTD pool exhausted - all {} descriptors allocated", N_QTD);
            return None;
        };

        let handle = QtdHandle::new(index as u16);
        debug_assert!(is_dma_aligned(self.transfer_descriptor_physical(handle) as usize));
        self.transfer_descriptors[index].init_placeholder();
        Some(handle)
    }

    fn free_transfer_descriptor(&self, handle: QtdHandle) {
        Self::release(&self.qtd_allocated, handle.index());
    }

    fn transfer_descriptor(&self, handle: QtdHandle) -> &QueueTD {
        &self.transfer_descriptors[handle.index()]
    }

    fn transfer_descriptor_physical(&self, handle: QtdHandle) -> u32 {
        &self.transfer_descriptors[handle.index()] as *const QueueTD as usize as u32
    }

    fn transfer_descriptor_at(&self, physical: u32) -> Option<QtdHandle> {
        Self::lookup(&self.transfer_descriptors, physical & !0x1F)
            .map(|index| QtdHandle::new(index as u16))
    }

    fn queue_head_at(&self, physical: u32) -> Option<QhHandle> {
        Self::lookup(&self.queue_heads, physical & !0x1F).map(|index| QhHandle::new(index as u16))
    }

    fn stats(&self) -> PoolStats {
        let qh_used = self
            .qh_allocated
            .iter()
            .filter(|a| a.load(Ordering::Relaxed))
            .count();
        let qtd_used = self
            .qtd_allocated
            .iter()
            .filter(|a| a.load(Ordering::Relaxed))
            .count();

        PoolStats {
            qh_total: N_QH,
            qh_available: N_QH - qh_used,
            qtd_total: N_QTD,
            qtd_available: N_QTD - qtd_used,
        }
    }
}

/// Pool utilization statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of Queue Head descriptors in pool
    pub qh_total: usize,
    /// Number of available (unallocated) Queue Heads
    pub qh_available: usize,
    /// Total number of Queue Transfer Descriptors in pool
    pub qtd_total: usize,
    /// Number of available (unallocated) qTDs
    pub qtd_available: usize,
}

impl PoolStats {
    /// Queue heads currently handed out
    pub const fn qh_in_use(&self) -> usize {
        self.qh_total - self.qh_available
    }

    /// Transfer descriptors currently handed out
    pub const fn qtd_in_use(&self) -> usize {
        self.qtd_total - self.qtd_available
    }
}
