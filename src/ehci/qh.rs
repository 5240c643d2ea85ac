//! Queue Head (qH) implementation for EHCI
//!
//! Based on EHCI Specification Section 3.6

use core::sync::atomic::{AtomicU32, Ordering};

use super::qtd::{token, BUFFER_POINTER_COUNT};
use super::register::{read_ordered, write_ordered};

/// Link pointer encoding shared by frame list entries, horizontal links and
/// qTD next pointers
#[allow(missing_docs)]
pub mod link {
    pub const TERMINATE: u32 = 1;
    pub const TYPE_ITD: u32 = 0 << 1;
    pub const TYPE_QH: u32 = 1 << 1;
    pub const TYPE_SITD: u32 = 2 << 1;
    pub const TYPE_FSTN: u32 = 3 << 1;
    pub const ADDRESS_MASK: u32 = !0x1F;

    /// Encode a queue head reference
    pub const fn queue_head(physical: u32) -> u32 {
        (physical & ADDRESS_MASK) | TYPE_QH
    }
}

/// Endpoint characteristics field bits
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const INACTIVE_ON_NEXT: u32 = 1 << 7;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;
    pub const SPEED_FULL: u32 = 0;
    pub const SPEED_LOW: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;

    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;

    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
    pub const NAK_COUNT_RELOAD_MASK: u32 = 0xF;
    pub const NAK_COUNT_RELOAD_MAX: u32 = 0xF;
}

/// Endpoint capabilities field bits
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const INTERRUPT_SCHEDULE_MASK_MASK: u32 = 0xFF;

    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;
    pub const SPLIT_COMPLETION_MASK_MASK: u32 = 0xFF;

    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;

    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;

    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0x3;

    /// One transaction per micro-frame
    pub const MULT_ONE: u32 = 1 << MULT_SHIFT;
}

/// Queue Head (qH)
///
/// EHCI Specification Section 3.6
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to next qH (bit 0 = terminate, bits 2:1 = type)
    pub horizontal_link: AtomicU32,

    /// Endpoint characteristics ("destination")
    pub endpoint_chars: AtomicU32,

    /// Endpoint capabilities (split transaction, multiplier)
    pub endpoint_caps: AtomicU32,

    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,

    /// Overlay next qTD pointer
    pub next_qtd: AtomicU32,

    /// Overlay alternate next qTD
    pub alt_next_qtd: AtomicU32,

    /// Overlay token (status and control)
    pub token: AtomicU32,

    /// Overlay buffer pointers
    pub buffer_pointers: [AtomicU32; BUFFER_POINTER_COUNT],

    /// Overlay buffer pointer upper halves
    pub ext_buffer_pointers: [AtomicU32; BUFFER_POINTER_COUNT],

    _reserved: [u32; 7],
}

impl QueueHead {
    /// Create new inactive Queue Head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(link::TERMINATE),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(0),
            next_qtd: AtomicU32::new(link::TERMINATE),
            alt_next_qtd: AtomicU32::new(link::TERMINATE),
            token: AtomicU32::new(0),
            buffer_pointers: [const { AtomicU32::new(0) }; BUFFER_POINTER_COUNT],
            ext_buffer_pointers: [const { AtomicU32::new(0) }; BUFFER_POINTER_COUNT],
            _reserved: [0; 7],
        }
    }

    /// Initialize an empty queue head that never carries transfers
    ///
    /// Used for the periodic tree anchors and the asynchronous list head: a
    /// halted overlay with terminated links.
    pub fn init_empty(&self, endpoint_chars: u32) {
        self.horizontal_link.store(link::TERMINATE, Ordering::Relaxed);
        self.endpoint_chars.store(endpoint_chars, Ordering::Relaxed);
        self.endpoint_caps.store(capabilities::MULT_ONE, Ordering::Relaxed);
        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(link::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(link::TERMINATE, Ordering::Relaxed);
        self.clear_overlay_buffers();
        write_ordered(&self.token, token::STATUS_HALTED);
    }

    /// Initialize the queue head of an endpoint, pointed at its placeholder
    /// descriptor
    pub fn init_endpoint(&self, endpoint_chars: u32, endpoint_caps: u32, placeholder: u32) {
        self.horizontal_link.store(link::TERMINATE, Ordering::Relaxed);
        self.endpoint_chars.store(endpoint_chars, Ordering::Relaxed);
        self.endpoint_caps.store(endpoint_caps, Ordering::Relaxed);
        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(placeholder, Ordering::Relaxed);
        self.alt_next_qtd.store(placeholder, Ordering::Relaxed);
        self.clear_overlay_buffers();
        write_ordered(&self.token, 0);
    }

    fn clear_overlay_buffers(&self) {
        for i in 0..BUFFER_POINTER_COUNT {
            self.buffer_pointers[i].store(0, Ordering::Relaxed);
            self.ext_buffer_pointers[i].store(0, Ordering::Relaxed);
        }
    }

    /// Horizontal link as currently programmed
    pub fn horizontal(&self) -> u32 {
        read_ordered(&self.horizontal_link)
    }

    /// Rewrite the horizontal link; the controller may be following it
    pub fn set_horizontal(&self, value: u32) {
        write_ordered(&self.horizontal_link, value);
    }

    /// Device address currently encoded in the characteristics
    pub fn device_address(&self) -> u8 {
        ((self.endpoint_chars.load(Ordering::Relaxed) >> endpoint::DEVICE_ADDRESS_SHIFT)
            & endpoint::DEVICE_ADDRESS_MASK) as u8
    }

    /// Fill in the device address (the field starts out as zero)
    pub fn set_device_address(&self, address: u8) {
        let chars = self.endpoint_chars.load(Ordering::Relaxed)
            & !(endpoint::DEVICE_ADDRESS_MASK << endpoint::DEVICE_ADDRESS_SHIFT);
        let chars = chars
            | ((address as u32 & endpoint::DEVICE_ADDRESS_MASK) << endpoint::DEVICE_ADDRESS_SHIFT);
        write_ordered(&self.endpoint_chars, chars);
    }

    /// Max packet length currently encoded in the characteristics
    pub fn max_packet_size(&self) -> u16 {
        ((self.endpoint_chars.load(Ordering::Relaxed) >> endpoint::MAX_PACKET_LENGTH_SHIFT)
            & endpoint::MAX_PACKET_LENGTH_MASK) as u16
    }

    /// Change the max packet length
    pub fn set_max_packet_size(&self, max_packet_size: u16) {
        let chars = self.endpoint_chars.load(Ordering::Relaxed)
            & !(endpoint::MAX_PACKET_LENGTH_MASK << endpoint::MAX_PACKET_LENGTH_SHIFT);
        let chars = chars
            | ((max_packet_size as u32 & endpoint::MAX_PACKET_LENGTH_MASK)
                << endpoint::MAX_PACKET_LENGTH_SHIFT);
        write_ordered(&self.endpoint_chars, chars);
    }

    /// Clear the data toggle cached in the overlay
    pub fn clear_data_toggle(&self) {
        let value = self.token.load(Ordering::Relaxed) & !token::DATA_TOGGLE;
        write_ordered(&self.token, value);
    }

    /// Overlay token as last written by hardware
    pub fn overlay_token(&self) -> u32 {
        read_ordered(&self.token)
    }

    /// Check if the overlay holds an active transaction
    pub fn is_active(&self) -> bool {
        self.overlay_token() & token::STATUS_ACTIVE != 0
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

// Ensure size is correct per EHCI spec
const _: () = assert!(core::mem::size_of::<QueueHead>() == 96);
const _: () = assert!(core::mem::align_of::<QueueHead>() >= 32);
