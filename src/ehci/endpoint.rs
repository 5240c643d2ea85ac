//! Endpoint state and queue head encoding
//!
//! Every control, bulk and interrupt endpoint owns one queue head plus a
//! halted placeholder descriptor at the tail of its chain. Isochronous
//! endpoints are accepted but get no queue.

use heapless::Vec;

use super::limits::MAX_ENDPOINT_TRANSFERS;
use super::periodic::{microframes_to_frames, poll_rate_tree_level, round_poll_rate};
use super::qh::{capabilities, endpoint};
use super::transfer_set::TransferId;
use crate::dma::QhHandle;
use crate::transfer::{DeviceSpeed, EndpointRequest, TransferType};

/// Where a queue head sits in the hardware schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// On the asynchronous ring (control and bulk)
    Asynchronous,
    /// After the anchor of a periodic tree level (interrupt)
    Periodic {
        /// Tree level, 0 is the least frequently polled
        level: usize,
    },
}

/// Linkage state of a queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Reachable by the controller
    Linked,
    /// Unlinked from the periodic schedule, waiting out a frame
    Unlinked,
    /// Unlinked from the asynchronous ring, waiting for a doorbell
    PendingDoorbell {
        /// Doorbell ring that releases the queue
        generation: u32,
    },
    /// Out of the schedule for good, memory not yet released
    Removed,
}

/// Hardware queue of an endpoint
#[derive(Debug)]
pub struct TransferQueue {
    /// Queue head handle
    pub head: QhHandle,
    /// Physical address of the queue head
    pub physical: u32,
    /// Halted placeholder at the end of the chain
    pub dummy: TransferId,
    /// Schedule the queue belongs to
    pub placement: Placement,
    /// Linkage state
    pub state: QueueState,
    /// The queue was pulled to remove cancelled transfer sets
    pub cancel_pending: bool,
}

/// Software state of one endpoint
#[derive(Debug)]
pub struct Endpoint {
    /// Transfer type
    pub transfer_type: TransferType,
    /// Device speed
    pub speed: DeviceSpeed,
    /// Max packet size
    pub max_packet_size: u16,
    /// Endpoint number
    pub endpoint_number: u8,
    /// Poll interval in frames after conversion and rounding
    pub poll_rate: u32,
    /// Hardware queue, absent for isochronous endpoints
    pub queue: Option<TransferQueue>,
    /// Descriptors queued on this endpoint in chain order
    pub transfers: Vec<TransferId, MAX_ENDPOINT_TRANSFERS>,
    /// Destruction was requested
    pub destroying: bool,
}

impl Endpoint {
    /// Software state for a new endpoint, before any hardware is attached
    pub fn new(request: &EndpointRequest) -> Self {
        let mut poll_rate = request.poll_rate;
        if request.speed == DeviceSpeed::High {
            poll_rate = microframes_to_frames(poll_rate);
        }

        if request.transfer_type == TransferType::Interrupt {
            poll_rate = round_poll_rate(poll_rate);
        }

        Self {
            transfer_type: request.transfer_type,
            speed: request.speed,
            max_packet_size: request.max_packet_size,
            endpoint_number: request.endpoint_number,
            poll_rate,
            queue: None,
            transfers: Vec::new(),
            destroying: false,
        }
    }

    /// Schedule placement for this endpoint's queue head
    pub fn placement(&self) -> Placement {
        match self.transfer_type {
            TransferType::Interrupt => Placement::Periodic {
                level: poll_rate_tree_level(self.poll_rate),
            },
            _ => Placement::Asynchronous,
        }
    }
}

/// Endpoint characteristics word (device address left at zero)
pub fn characteristics(request: &EndpointRequest) -> u32 {
    let nak_reload = if request.transfer_type.is_asynchronous() {
        endpoint::NAK_COUNT_RELOAD_MAX
    } else {
        0
    };

    let speed = match request.speed {
        DeviceSpeed::Full => endpoint::SPEED_FULL,
        DeviceSpeed::Low => endpoint::SPEED_LOW,
        DeviceSpeed::High => endpoint::SPEED_HIGH,
    };

    let mut chars = (nak_reload << endpoint::NAK_COUNT_RELOAD_SHIFT)
        | ((request.max_packet_size as u32 & endpoint::MAX_PACKET_LENGTH_MASK)
            << endpoint::MAX_PACKET_LENGTH_SHIFT)
        | ((request.endpoint_number as u32 & endpoint::ENDPOINT_NUMBER_MASK)
            << endpoint::ENDPOINT_NUMBER_SHIFT)
        | (speed << endpoint::ENDPOINT_SPEED_SHIFT);

    // Control endpoints take their toggle from the descriptors
    if request.transfer_type == TransferType::Control {
        chars |= endpoint::DATA_TOGGLE_CONTROL;
        if request.speed != DeviceSpeed::High {
            chars |= endpoint::CONTROL_ENDPOINT;
        }
    }

    chars
}

/// Endpoint capabilities word
///
/// `endpoint_count` is the number of endpoints created before this one; it
/// spreads interrupt start micro-frames round-robin.
pub fn split_information(request: &EndpointRequest, endpoint_count: usize) -> u32 {
    let mut caps = capabilities::MULT_ONE;
    let interrupt = request.transfer_type == TransferType::Interrupt;

    if request.speed != DeviceSpeed::High {
        caps |= (request.hub_port as u32 & capabilities::PORT_NUMBER_MASK)
            << capabilities::PORT_NUMBER_SHIFT;
        caps |= (request.hub_address as u32 & capabilities::HUB_ADDRESS_MASK)
            << capabilities::HUB_ADDRESS_SHIFT;

        if interrupt {
            // Start splits stay in micro-frames 0-3 so no frame span
            // traversal node is ever needed
            let start = (endpoint_count & 0x3) as u32;
            let completion = 0b111 << (start + 2);
            caps |= (completion & capabilities::SPLIT_COMPLETION_MASK_MASK)
                << capabilities::SPLIT_COMPLETION_MASK_SHIFT;
            caps |= 1 << start;
        }
    } else if interrupt {
        caps |= 1 << (endpoint_count & 0x7);
    }

    caps
}
