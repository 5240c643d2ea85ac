#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! EHCI USB 2.0 host controller driver
//!
//! This crate schedules control, bulk and interrupt transfers on an EHCI
//! host controller for `no_std` targets. It builds and maintains the data
//! structures the controller walks by DMA (the periodic frame list and tree,
//! the asynchronous ring of queue heads, and the transfer descriptors queued
//! on them) and reports completions back to a USB core.
//!
//! # Core Components
//!
//! - [`ehci`] - register block, hardware descriptors, schedule and controller
//! - [`dma`] - descriptor allocator for DMA-visible memory
//! - [`host`] - traits between the controller and the USB core
//! - [`transfer`] - endpoint and transfer requests, handles and completions
//! - [`error`] - status codes and per-transfer error detail
//!
//! # Usage
//!
//! ```ignore
//! static REGS: ... = unsafe { OperationalRegisters::from_capability_base(BASE) };
//! static POOL: DescriptorPool<32, 256> = DescriptorPool::new();
//! static FRAMES: PeriodicFrameList = PeriodicFrameList::new();
//!
//! let controller = EhciController::new(REGS, &POOL, &FRAMES, core, EhciConfig::default(), None)?;
//! controller.reset_controller(&mut delay)?;
//!
//! // From the USB interrupt
//! if controller.interrupt_service() {
//!     // Later, outside interrupt context
//!     controller.interrupt_dispatch();
//! }
//! ```

#[cfg(feature = "defmt")]
use defmt as _;

pub mod dma;
pub mod ehci;
pub mod error;
pub mod host;
pub mod transfer;

pub use dma::{DescriptorAllocator, DescriptorPool};
pub use ehci::{
    DebugFlags, DebugHandoff, EhciConfig, EhciController, OperationalRegisters, PeriodicFrameList,
    PortStatus, PortStatusFlags, RootHubStatus, ScheduleStats,
};
pub use error::{Result, TransferError, UsbError};
pub use host::{HostCallbacks, HostController};
pub use transfer::{
    DeviceSpeed, Direction, EndpointHandle, EndpointRequest, TransferCompletion, TransferFlags,
    TransferHandle, TransferRequest, TransferType,
};
