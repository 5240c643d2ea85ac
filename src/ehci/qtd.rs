//! Queue Transfer Descriptor (qTD) implementation for EHCI
//!
//! Based on EHCI Specification Section 3.5

use core::sync::atomic::{AtomicU32, Ordering};

use super::register::{read_ordered, write_ordered};
use crate::dma::PAGE_SIZE;
use crate::error::TransferError;

/// qTD token field bit definitions
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_SPLIT_STATE: u32 = 1 << 1;
    pub const STATUS_PING_STATE: u32 = 1 << 0;

    /// Any status bit that means the transaction failed
    pub const STATUS_ERROR_MASK: u32 = STATUS_HALTED
        | STATUS_DATA_BUFFER_ERROR
        | STATUS_BABBLE
        | STATUS_TRANSACTION_ERROR
        | STATUS_MISSED_MICROFRAME;

    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 0x3 << PID_SHIFT;
    pub const PID_OUT: u32 = 0x0 << 8;
    pub const PID_IN: u32 = 0x1 << 8;
    pub const PID_SETUP: u32 = 0x2 << 8;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;
    pub const ERROR_COUNTER_MASK: u32 = 0x3;

    pub const CURRENT_PAGE_SHIFT: u32 = 12;
    pub const CURRENT_PAGE_MASK: u32 = 0x7;

    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;

    /// Retry budget programmed into every descriptor
    pub const DEFAULT_ERROR_COUNT: u32 = 3;

    /// Build an active token
    pub const fn active(length: u32, pid: u32, data_toggle: bool, interrupt: bool) -> u32 {
        let mut token = STATUS_ACTIVE
            | pid
            | (DEFAULT_ERROR_COUNT << ERROR_COUNTER_SHIFT)
            | ((length & TOTAL_BYTES_MASK) << TOTAL_BYTES_SHIFT);
        if data_toggle {
            token |= DATA_TOGGLE;
        }
        if interrupt {
            token |= INTERRUPT_ON_COMPLETE;
        }
        token
    }

    /// Bytes hardware has not yet moved
    pub const fn bytes_remaining(token: u32) -> u32 {
        (token >> TOTAL_BYTES_SHIFT) & TOTAL_BYTES_MASK
    }
}

/// Number of buffer page pointers in a descriptor
pub const BUFFER_POINTER_COUNT: usize = 5;

/// Largest transfer one descriptor can describe (five pages)
pub const MAX_DESCRIPTOR_TRANSFER: u32 = (BUFFER_POINTER_COUNT * PAGE_SIZE) as u32;

/// Decode the error bits of a finished token into the most specific outcome
///
/// Halted wins, since it is the one that needs a corrective action on the
/// queue head.
pub fn token_error(token: u32) -> TransferError {
    if token & token::STATUS_HALTED != 0 {
        TransferError::Stalled
    } else if token & token::STATUS_MISSED_MICROFRAME != 0 {
        TransferError::MissedMicroframe
    } else if token & token::STATUS_TRANSACTION_ERROR != 0 {
        TransferError::CrcOrTimeout
    } else if token & token::STATUS_BABBLE != 0 {
        TransferError::Babble
    } else if token & token::STATUS_DATA_BUFFER_ERROR != 0 {
        TransferError::DataBuffer
    } else {
        TransferError::None
    }
}

/// Queue Transfer Descriptor (qTD)
///
/// EHCI Specification Section 3.5 with the Appendix B 64-bit extension.
/// Must be 32-byte aligned for DMA.
#[repr(C, align(32))]
pub struct QueueTD {
    /// Next qTD pointer (bits 31:5 valid, bit 0 = terminate)
    pub next_qtd: AtomicU32,

    /// Alternate next qTD pointer (taken on short packets)
    pub alt_next_qtd: AtomicU32,

    /// Token field containing status, PID, and transfer length
    pub token: AtomicU32,

    /// Buffer pointer pages (up to 5 pages, 4KB each = 20KB max)
    pub buffer_pointers: [AtomicU32; BUFFER_POINTER_COUNT],

    /// Upper 32 bits of each buffer pointer
    pub ext_buffer_pointers: [AtomicU32; BUFFER_POINTER_COUNT],

    _reserved: [u32; 3],
}

impl QueueTD {
    /// qTD terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create a new inactive qTD
    pub const fn new() -> Self {
        Self {
            next_qtd: AtomicU32::new(Self::TERMINATE),
            alt_next_qtd: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(0),
            buffer_pointers: [const { AtomicU32::new(0) }; BUFFER_POINTER_COUNT],
            ext_buffer_pointers: [const { AtomicU32::new(0) }; BUFFER_POINTER_COUNT],
            _reserved: [0; 3],
        }
    }

    /// Turn this descriptor into an end-of-queue placeholder
    ///
    /// Hardware stops on a halted descriptor and never follows its links.
    pub fn init_placeholder(&self) {
        self.next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        for i in 0..BUFFER_POINTER_COUNT {
            self.buffer_pointers[i].store(0, Ordering::Relaxed);
            self.ext_buffer_pointers[i].store(0, Ordering::Relaxed);
        }
        write_ordered(&self.token, token::STATUS_HALTED);
    }

    /// Point the buffer page list at `length` bytes starting at `physical`
    ///
    /// The first pointer keeps the byte offset, every following pointer is
    /// the next page boundary.
    pub fn set_buffer(&self, physical: u32, length: u32) {
        let end = physical as u64 + length as u64;
        let mut address = physical as u64;
        for i in 0..BUFFER_POINTER_COUNT {
            if address < end {
                self.buffer_pointers[i].store(address as u32, Ordering::Relaxed);
                address = (address + PAGE_SIZE as u64) & !(PAGE_SIZE as u64 - 1);
            } else {
                self.buffer_pointers[i].store(0, Ordering::Relaxed);
            }

            self.ext_buffer_pointers[i].store(0, Ordering::Relaxed);
        }
    }

    /// Reconstruct the byte ranges this descriptor covers for `length` bytes
    ///
    /// Each entry is `(physical start, byte count)`.
    pub fn buffer_ranges(&self, length: u32) -> heapless::Vec<(u32, u32), BUFFER_POINTER_COUNT> {
        let mut ranges = heapless::Vec::new();
        let mut remaining = length;
        for pointer in &self.buffer_pointers {
            if remaining == 0 {
                break;
            }

            let start = pointer.load(Ordering::Relaxed);
            let page_end = (start & !(PAGE_SIZE as u32 - 1)) as u64 + PAGE_SIZE as u64;
            let chunk = core::cmp::min(page_end - start as u64, remaining as u64) as u32;
            // Capacity equals the pointer count, so this cannot overflow
            let _ = ranges.push((start, chunk));
            remaining -= chunk;
        }

        ranges
    }

    /// Copy everything except the token from `other`
    pub fn copy_links_and_buffers(&self, other: &QueueTD) {
        self.next_qtd
            .store(other.next_qtd.load(Ordering::Relaxed), Ordering::Relaxed);
        self.alt_next_qtd
            .store(other.alt_next_qtd.load(Ordering::Relaxed), Ordering::Relaxed);
        for i in 0..BUFFER_POINTER_COUNT {
            self.buffer_pointers[i].store(
                other.buffer_pointers[i].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            self.ext_buffer_pointers[i].store(
                other.ext_buffer_pointers[i].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
    }

    /// Current token as last written by hardware
    pub fn token(&self) -> u32 {
        read_ordered(&self.token)
    }

    /// Check if qTD is still active
    pub fn is_active(&self) -> bool {
        self.token() & token::STATUS_ACTIVE != 0
    }

    /// Bytes hardware has not yet moved
    pub fn bytes_remaining(&self) -> u32 {
        token::bytes_remaining(self.token())
    }

    /// Error outcome of a finished descriptor
    pub fn error(&self) -> TransferError {
        token_error(self.token())
    }
}

impl Default for QueueTD {
    fn default() -> Self {
        Self::new()
    }
}

// 13 hardware words padded out to two 32-byte lines
const _: () = assert!(core::mem::size_of::<QueueTD>() == 64);
const _: () = assert!(core::mem::align_of::<QueueTD>() == 32);

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_qtd_creation() {
        let qtd = QueueTD::new();

        assert_eq!(qtd.next_qtd.load(Ordering::Relaxed), QueueTD::TERMINATE);
        assert_eq!(qtd.alt_next_qtd.load(Ordering::Relaxed), QueueTD::TERMINATE);
        assert_eq!(qtd.token.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_qtd_placeholder() {
        let qtd = QueueTD::new();
        qtd.next_qtd.store(0x1000, Ordering::Relaxed);
        qtd.buffer_pointers[2].store(0x5000, Ordering::Relaxed);
        qtd.token.store(token::STATUS_ACTIVE, Ordering::Relaxed);

        qtd.init_placeholder();

        assert!(!qtd.is_active());
        assert_eq!(qtd.token(), token::STATUS_HALTED);
        assert_eq!(qtd.next_qtd.load(Ordering::Relaxed), QueueTD::TERMINATE);
        assert_eq!(qtd.alt_next_qtd.load(Ordering::Relaxed), QueueTD::TERMINATE);
        assert_eq!(qtd.buffer_pointers[2].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_token_builder() {
        let t = token::active(512, token::PID_IN, true, true);
        assert_ne!(t & token::STATUS_ACTIVE, 0);
        assert_eq!(t & token::PID_MASK, token::PID_IN);
        assert_ne!(t & token::DATA_TOGGLE, 0);
        assert_ne!(t & token::INTERRUPT_ON_COMPLETE, 0);
        assert_eq!(token::bytes_remaining(t), 512);
        assert_eq!((t >> token::ERROR_COUNTER_SHIFT) & token::ERROR_COUNTER_MASK, 3);
    }

    #[test]
    fn test_error_priority() {
        assert_eq!(token_error(0), TransferError::None);
        assert_eq!(
            token_error(token::STATUS_HALTED | token::STATUS_BABBLE),
            TransferError::Stalled
        );
        assert_eq!(
            token_error(token::STATUS_MISSED_MICROFRAME | token::STATUS_TRANSACTION_ERROR),
            TransferError::MissedMicroframe
        );
        assert_eq!(
            token_error(token::STATUS_TRANSACTION_ERROR | token::STATUS_BABBLE),
            TransferError::CrcOrTimeout
        );
        assert_eq!(
            token_error(token::STATUS_BABBLE | token::STATUS_DATA_BUFFER_ERROR),
            TransferError::Babble
        );
        assert_eq!(
            token_error(token::STATUS_DATA_BUFFER_ERROR),
            TransferError::DataBuffer
        );
    }

    #[test]
    fn test_buffer_page_scatter() {
        let qtd = QueueTD::new();
        qtd.set_buffer(0x2000_0F00, 0x2100);

        assert_eq!(qtd.buffer_pointers[0].load(Ordering::Relaxed), 0x2000_0F00);
        assert_eq!(qtd.buffer_pointers[1].load(Ordering::Relaxed), 0x2000_1000);
        assert_eq!(qtd.buffer_pointers[2].load(Ordering::Relaxed), 0x2000_2000);
        assert_eq!(qtd.buffer_pointers[3].load(Ordering::Relaxed), 0);

        let ranges = qtd.buffer_ranges(0x2100);
        assert_eq!(
            ranges.as_slice(),
            &[(0x2000_0F00, 0x100), (0x2000_1000, 0x1000), (0x2000_2000, 0x1000)]
        );
    }

    #[test]
    fn test_zero_length_buffer() {
        let qtd = QueueTD::new();
        qtd.set_buffer(0x3000_0010, 0);
        for pointer in &qtd.buffer_pointers {
            assert_eq!(pointer.load(Ordering::Relaxed), 0);
        }
        assert!(qtd.buffer_ranges(0).is_empty());
    }

    #[test]
    fn test_copy_links_and_buffers_keeps_token() {
        let source = QueueTD::new();
        source.next_qtd.store(0x100, Ordering::Relaxed);
        source.alt_next_qtd.store(0x200, Ordering::Relaxed);
        source.set_buffer(0x1000, 16);
        source.token.store(token::STATUS_ACTIVE, Ordering::Relaxed);

        let target = QueueTD::new();
        target.init_placeholder();
        target.copy_links_and_buffers(&source);

        assert_eq!(target.next_qtd.load(Ordering::Relaxed), 0x100);
        assert_eq!(target.alt_next_qtd.load(Ordering::Relaxed), 0x200);
        assert_eq!(target.buffer_pointers[0].load(Ordering::Relaxed), 0x1000);
        assert_eq!(target.token(), token::STATUS_HALTED);
    }

    #[test]
    fn test_qtd_size_alignment() {
        assert_eq!(core::mem::size_of::<QueueTD>(), 64);
        assert_eq!(core::mem::align_of::<QueueTD>(), 32);

        let qtd = QueueTD::new();
        let addr = &qtd as *const _ as usize;
        assert_eq!(addr & 0x1F, 0, "QueueTD not 32-byte aligned");
    }
}
