//! Interfaces between the host controller driver and the USB core

use embedded_hal::delay::DelayNs;

use crate::ehci::RootHubStatus;
use crate::error::Result;
use crate::transfer::{
    EndpointHandle, EndpointRequest, TransferCompletion, TransferFlags, TransferHandle,
    TransferRequest,
};

/// Operations the USB core drives a host controller through
///
/// Methods that may have to wait for the hardware take a [`DelayNs`]; none of
/// them wait while holding the controller lock.
pub trait HostController {
    /// Create the schedule state for an endpoint
    fn create_endpoint(&self, request: &EndpointRequest) -> Result<EndpointHandle>;

    /// Update the max packet size and reset the data toggle of an idle endpoint
    fn reset_endpoint(&self, endpoint: EndpointHandle, max_packet_size: u16) -> Result<()>;

    /// Run every queued transfer of an endpoint to completion without
    /// interrupts, returning how many transfer sets were retired
    fn flush_endpoint<D: DelayNs>(&self, endpoint: EndpointHandle, delay: &mut D) -> Result<u32>;

    /// Tear an endpoint down once the hardware has provably let go of it
    fn destroy_endpoint<D: DelayNs>(&self, endpoint: EndpointHandle, delay: &mut D) -> Result<()>;

    /// Reserve descriptors for transfers of up to `max_buffer_size` bytes
    fn create_transfer(
        &self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle>;

    /// Release a transfer that is not queued
    fn destroy_transfer(&self, transfer: TransferHandle) -> Result<()>;

    /// Queue a transfer; its completion is reported through [`HostCallbacks`]
    fn submit_transfer(&self, transfer: TransferHandle, request: &TransferRequest) -> Result<()>;

    /// Run a transfer to completion by polling, returning the bytes moved
    fn submit_polled_transfer<D: DelayNs>(
        &self,
        transfer: TransferHandle,
        request: &TransferRequest,
        delay: &mut D,
    ) -> Result<u32>;

    /// Pull a queued transfer out of the schedule
    ///
    /// `Err(UsbError::TooLate)` means the transfer already completed or is
    /// not queued. On success the completion callback fires exactly once for
    /// the submission, reporting it as cancelled unless the hardware
    /// finished it first.
    ///
    /// [`UsbError::TooLate`]: crate::error::UsbError::TooLate
    fn cancel_transfer<D: DelayNs>(&self, transfer: TransferHandle, delay: &mut D) -> Result<()>;

    /// Refresh the software view of the root hub ports
    fn get_root_hub_status(&self, status: &mut RootHubStatus) -> Result<()>;

    /// Apply the port changes flagged in `status`
    fn set_root_hub_status<D: DelayNs>(
        &self,
        status: &mut RootHubStatus,
        delay: &mut D,
    ) -> Result<()>;
}

/// Notifications the controller sends up to the USB core
///
/// Called from the deferred interrupt handler after the controller lock has
/// been released.
pub trait HostCallbacks {
    /// A submitted transfer finished, failed or was cancelled
    fn transfer_completed(&self, completion: TransferCompletion);

    /// A root hub port changed state
    fn port_changed(&self);

    /// Endpoints are waiting for [`destroy_queued_endpoints`]
    ///
    /// [`destroy_queued_endpoints`]: crate::ehci::EhciController::destroy_queued_endpoints
    fn schedule_destroy_work(&self);
}
