//! Transfer and endpoint descriptions exchanged with the USB core
//!
//! The USB core describes endpoints and transfers with these types and gets
//! back opaque handles; the host controller never sees device-level concepts
//! such as configurations or interfaces.

use bitflags::bitflags;

use crate::error::{Result, TransferError};

/// Size of the setup packet that opens every control transfer
pub const SETUP_PACKET_SIZE: u32 = 8;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    /// Control transfers (setup, optional data, status)
    Control,
    /// Bulk transfers
    Bulk,
    /// Interrupt transfers, polled from the periodic schedule
    Interrupt,
    /// Isochronous transfers (endpoints can be created but not used)
    Isochronous,
}

impl TransferType {
    /// Control and bulk endpoints live on the asynchronous schedule
    pub const fn is_asynchronous(self) -> bool {
        matches!(self, Self::Control | Self::Bulk)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Device speed as seen by the root hub or parent hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceSpeed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
}

bitflags! {
    /// Per-transfer behaviour requested by the USB core
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferFlags: u32 {
        /// End the transfer with a short (possibly zero length) packet
        const FORCE_SHORT_TRANSFER = 1 << 0;
        /// Treat a short transfer as an error
        const NO_SHORT_TRANSFERS = 1 << 1;
        /// Do not raise an interrupt when the transfer finishes
        const NO_INTERRUPT_ON_COMPLETION = 1 << 2;
    }
}

/// Endpoint the USB core wants scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRequest {
    /// Transfer type of the endpoint
    pub transfer_type: TransferType,
    /// Direction (only meaningful for non-control endpoints)
    pub direction: Direction,
    /// Device speed
    pub speed: DeviceSpeed,
    /// Endpoint number (0-15)
    pub endpoint_number: u8,
    /// Maximum packet size
    pub max_packet_size: u16,
    /// Poll interval: frames at low and full speed, micro-frames at high speed
    pub poll_rate: u32,
    /// Address of the high-speed hub doing split transactions (low/full speed)
    pub hub_address: u8,
    /// Port on that hub
    pub hub_port: u8,
}

impl EndpointRequest {
    /// Control endpoint with the given max packet size
    pub const fn control(speed: DeviceSpeed, endpoint_number: u8, max_packet_size: u16) -> Self {
        Self {
            transfer_type: TransferType::Control,
            direction: Direction::Out,
            speed,
            endpoint_number,
            max_packet_size,
            poll_rate: 0,
            hub_address: 0,
            hub_port: 0,
        }
    }

    /// Bulk endpoint
    pub const fn bulk(
        speed: DeviceSpeed,
        endpoint_number: u8,
        direction: Direction,
        max_packet_size: u16,
    ) -> Self {
        Self {
            transfer_type: TransferType::Bulk,
            direction,
            speed,
            endpoint_number,
            max_packet_size,
            poll_rate: 0,
            hub_address: 0,
            hub_port: 0,
        }
    }

    /// Interrupt endpoint polled every `poll_rate` units
    pub const fn interrupt(
        speed: DeviceSpeed,
        endpoint_number: u8,
        direction: Direction,
        max_packet_size: u16,
        poll_rate: u32,
    ) -> Self {
        Self {
            transfer_type: TransferType::Interrupt,
            direction,
            speed,
            endpoint_number,
            max_packet_size,
            poll_rate,
            hub_address: 0,
            hub_port: 0,
        }
    }

    /// Route a low or full speed endpoint through a high-speed hub
    pub const fn behind_hub(mut self, hub_address: u8, hub_port: u8) -> Self {
        self.hub_address = hub_address;
        self.hub_port = hub_port;
        self
    }
}

/// One logical transfer handed to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Current address of the device
    pub device_address: u8,
    /// Transfer direction (for control, the direction of the data stage)
    pub direction: Direction,
    /// Total length in bytes, including the setup packet for control
    pub length: u32,
    /// Physical address of the data buffer
    pub buffer_physical: u32,
    /// Transfer flags
    pub flags: TransferFlags,
}

impl TransferRequest {
    /// New request without flags
    pub const fn new(
        device_address: u8,
        direction: Direction,
        buffer_physical: u32,
        length: u32,
    ) -> Self {
        Self {
            device_address,
            direction,
            length,
            buffer_physical,
            flags: TransferFlags::empty(),
        }
    }

    /// Replace the flags
    pub const fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Opaque handle to an endpoint created on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointHandle(pub(crate) u16);

impl EndpointHandle {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque handle to a transfer created on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHandle(pub(crate) u16);

impl TransferHandle {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Final report for a transfer, delivered exactly once per submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCompletion {
    /// Which transfer finished
    pub transfer: TransferHandle,
    /// Status code of the transfer
    pub status: Result<()>,
    /// Specific error detail, `TransferError::None` on success
    pub error: TransferError,
    /// Bytes actually moved, including the setup packet for control
    pub length_transferred: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asynchronous_types() {
        assert!(TransferType::Control.is_asynchronous());
        assert!(TransferType::Bulk.is_asynchronous());
        assert!(!TransferType::Interrupt.is_asynchronous());
        assert!(!TransferType::Isochronous.is_asynchronous());
    }

    #[test]
    fn test_endpoint_request_builders() {
        let request = EndpointRequest::interrupt(DeviceSpeed::Full, 1, Direction::In, 8, 10)
            .behind_hub(3, 2);

        assert_eq!(request.transfer_type, TransferType::Interrupt);
        assert_eq!(request.hub_address, 3);
        assert_eq!(request.hub_port, 2);
        assert_eq!(request.poll_rate, 10);
    }

    #[test]
    fn test_transfer_request_flags() {
        let request = TransferRequest::new(5, Direction::Out, 0x2000_0000, 64)
            .with_flags(TransferFlags::FORCE_SHORT_TRANSFER);

        assert!(request.flags.contains(TransferFlags::FORCE_SHORT_TRANSFER));
        assert_eq!(request.device_address, 5);
    }
}
