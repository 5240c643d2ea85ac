//! EHCI (Enhanced Host Controller Interface) transfer scheduling
//!
//! This module holds the memory-mapped register structures, bit definitions
//! and the hardware descriptor layouts, plus the software schedule that keeps
//! them consistent while the controller walks them by DMA.
//!
//! # Register Memory Layout
//!
//! The EHCI controller registers are divided into:
//! - Capability Registers (read-only, offset 0x000-0x00F)
//! - Operational Registers (read-write, offset given by CAPLENGTH)
//!
//! Register definitions follow EHCI Specification Section 2 (Host Controller
//! Interface).

pub mod async_advance;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod handoff;
pub mod interrupt;
pub mod periodic;
pub mod qh;
pub mod qtd;
pub mod register;
pub mod root_hub;
pub mod schedule;
pub mod slab;
pub mod transfer_set;

pub use config::{DebugFlags, EhciConfig, EhciConfigBuilder};
pub use controller::EhciController;
pub use handoff::DebugHandoff;
pub use periodic::PeriodicFrameList;
pub use qh::QueueHead;
pub use qtd::QueueTD;
pub use register::{Register, RegisterTimeout};
pub use root_hub::{PortStatus, PortStatusFlags, RootHubStatus};
pub use schedule::ScheduleStats;

// Re-export important types for easier use
pub use qh::{capabilities, endpoint as queue_endpoint, link};
pub use qtd::token;

use bitflags::bitflags;

/// Compile-time capacities of the software schedule
pub mod limits {
    /// Endpoints alive at once, including those waiting to be destroyed
    pub const MAX_ENDPOINTS: usize = 32;
    /// Transfer sets alive at once
    pub const MAX_TRANSFER_SETS: usize = 64;
    /// Software transfer records, including one placeholder per endpoint
    pub const MAX_TRANSFERS: usize = 256;
    /// Hardware descriptors one transfer set may reserve
    pub const MAX_DESCRIPTORS_PER_SET: usize = 16;
    /// Descriptors queued on a single endpoint
    pub const MAX_ENDPOINT_TRANSFERS: usize = 64;
    /// Root hub ports (the N_PORTS field is four bits wide)
    pub const MAX_PORTS: usize = 15;
}

/// EHCI Capability Registers
#[repr(C)]
pub struct CapabilityRegisters {
    /// Capability register length and interface version (CAPLENGTH/HCIVERSION)
    pub caplength_hciversion: Register<u32>,
    /// Host Controller Structural Parameters (HCSPARAMS)
    pub hcsparams: Register<u32>,
    /// Host Controller Capability Parameters (HCCPARAMS)
    pub hccparams: Register<u32>,
    /// Host Controller Companion Port Route Description
    pub hcsp_portroute: Register<u32>,
}

impl CapabilityRegisters {
    /// Offset of the operational registers from the capability base
    pub fn operational_offset(&self) -> usize {
        (self.caplength_hciversion.read_relaxed() & 0xFF) as usize
    }

    /// Number of root hub ports the controller implements
    pub fn port_count(&self) -> u8 {
        HcSparams::from_bits_truncate(self.hcsparams.read_relaxed())
            .intersection(HcSparams::N_PORTS_MASK)
            .bits() as u8
    }
}

/// EHCI Operational Registers
#[repr(C)]
pub struct OperationalRegisters {
    /// USB Command Register (USBCMD)
    pub usbcmd: Register<u32>,
    /// USB Status Register (USBSTS)
    pub usbsts: Register<u32>,
    /// USB Interrupt Enable Register (USBINTR)
    pub usbintr: Register<u32>,
    /// USB Frame Index Register (FRINDEX)
    pub frindex: Register<u32>,
    /// Control Data Structure Segment Register (CTRLDSSEGMENT)
    pub ctrldssegment: Register<u32>,
    /// Periodic Frame List Base Address Register (PERIODICLISTBASE)
    pub periodiclistbase: Register<u32>,
    /// Asynchronous List Address Register (ASYNCLISTADDR)
    pub asynclistaddr: Register<u32>,
    /// Reserved space
    _reserved0: [u32; 9],
    /// Configured Flag Register (CONFIGFLAG)
    pub configflag: Register<u32>,
    /// Port Status and Control Registers (PORTSC)
    pub portsc: [Register<u32>; limits::MAX_PORTS],
}

impl OperationalRegisters {
    /// Register block with every register reading zero
    ///
    /// Real hardware is reached through a reference to the mapped block; an
    /// owned instance backs host-side simulation.
    pub const fn new() -> Self {
        Self {
            usbcmd: Register::new(0),
            usbsts: Register::new(0),
            usbintr: Register::new(0),
            frindex: Register::new(0),
            ctrldssegment: Register::new(0),
            periodiclistbase: Register::new(0),
            asynclistaddr: Register::new(0),
            _reserved0: [0; 9],
            configflag: Register::new(0),
            portsc: [const { Register::new(0) }; limits::MAX_PORTS],
        }
    }

    /// Operational registers of a controller mapped at `capability_base`
    ///
    /// # Safety
    ///
    /// `capability_base` must be the address of a mapped EHCI capability
    /// register block that stays mapped for the rest of the program, and no
    /// other code may drive the controller.
    pub unsafe fn from_capability_base(capability_base: usize) -> &'static Self {
        // Safety: guaranteed by the caller
        let capabilities = unsafe { &*(capability_base as *const CapabilityRegisters) };
        let offset = capabilities.operational_offset();
        // Safety: the operational block follows the capability block
        unsafe { &*((capability_base + offset) as *const Self) }
    }
}

impl Default for OperationalRegisters {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// USB Command Register (USBCMD) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (RS) - Bit 0
        const RUN_STOP = 1 << 0;
        /// Host Controller Reset (HCRESET) - Bit 1
        const HC_RESET = 1 << 1;
        /// Frame List Size - Bits [3:2]
        const FRAME_LIST_SIZE_MASK = 0b11 << 2;
        const FRAME_LIST_SIZE_1024 = 0b00 << 2;
        const FRAME_LIST_SIZE_512 = 0b01 << 2;
        const FRAME_LIST_SIZE_256 = 0b10 << 2;
        /// Periodic Schedule Enable (PSE) - Bit 4
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous Schedule Enable (ASE) - Bit 5
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on Async Advance Doorbell (IAAD) - Bit 6
        const INTERRUPT_ON_ASYNC_ADVANCE = 1 << 6;
        /// Light Host Controller Reset (LHCRESET) - Bit 7
        const LIGHT_HC_RESET = 1 << 7;
        /// Asynchronous Schedule Park Mode Count - Bits [9:8]
        const ASYNC_PARK_MODE_COUNT_MASK = 0b11 << 8;
        /// Asynchronous Schedule Park Mode Enable (ASPME) - Bit 11
        const ASYNC_PARK_MODE_ENABLE = 1 << 11;
        /// Interrupt Threshold Control - Bits [23:16]
        const INTERRUPT_THRESHOLD_MASK = 0xFF << 16;
    }
}

impl UsbCmd {
    /// Shift of the park mode count field
    pub const ASYNC_PARK_MODE_COUNT_SHIFT: u32 = 8;
    /// Shift of the interrupt threshold field
    pub const INTERRUPT_THRESHOLD_SHIFT: u32 = 16;
}

bitflags! {
    /// USB Status Register (USBSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// USB Interrupt (USBINT) - Bit 0
        const USB_INTERRUPT = 1 << 0;
        /// USB Error Interrupt (USBERRINT) - Bit 1
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port Change Detect (PCD) - Bit 2
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Frame List Rollover (FLR) - Bit 3
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host System Error (HSE) - Bit 4
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// Interrupt on Async Advance (IAA) - Bit 5
        const INTERRUPT_ON_ASYNC_ADVANCE = 1 << 5;
        /// Host Controller Halted (HCHalted) - Bit 12
        const HC_HALTED = 1 << 12;
        /// Reclamation (Reclamation) - Bit 13
        const RECLAMATION = 1 << 13;
        /// Periodic Schedule Status (PSS) - Bit 14
        const PERIODIC_SCHEDULE_STATUS = 1 << 14;
        /// Asynchronous Schedule Status (ASS) - Bit 15
        const ASYNC_SCHEDULE_STATUS = 1 << 15;
    }
}

impl UsbSts {
    /// Bits that raise the controller interrupt
    pub const INTERRUPT_MASK: Self = Self::USB_INTERRUPT
        .union(Self::USB_ERROR_INTERRUPT)
        .union(Self::PORT_CHANGE_DETECT)
        .union(Self::FRAME_LIST_ROLLOVER)
        .union(Self::HOST_SYSTEM_ERROR)
        .union(Self::INTERRUPT_ON_ASYNC_ADVANCE);
}

bitflags! {
    /// USB Interrupt Enable Register (USBINTR) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u32 {
        /// USB Interrupt Enable - Bit 0
        const USB_INTERRUPT_ENABLE = 1 << 0;
        /// USB Error Interrupt Enable - Bit 1
        const USB_ERROR_INTERRUPT_ENABLE = 1 << 1;
        /// Port Change Interrupt Enable - Bit 2
        const PORT_CHANGE_INTERRUPT_ENABLE = 1 << 2;
        /// Frame List Rollover Enable - Bit 3
        const FRAME_LIST_ROLLOVER_ENABLE = 1 << 3;
        /// Host System Error Enable - Bit 4
        const HOST_SYSTEM_ERROR_ENABLE = 1 << 4;
        /// Interrupt on Async Advance Enable - Bit 5
        const INTERRUPT_ON_ASYNC_ADVANCE_ENABLE = 1 << 5;
    }
}

bitflags! {
    /// Port Status and Control Register (PORTSC) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current Connect Status (CCS) - Bit 0
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Connect Status Change (CSC) - Bit 1
        const CONNECT_STATUS_CHANGE = 1 << 1;
        /// Port Enabled/Disabled (PED) - Bit 2
        const PORT_ENABLED = 1 << 2;
        /// Port Enable/Disable Change (PEDC) - Bit 3
        const PORT_ENABLE_CHANGE = 1 << 3;
        /// Over-current Active (OCA) - Bit 4
        const OVER_CURRENT_ACTIVE = 1 << 4;
        /// Over-current Change (OCC) - Bit 5
        const OVER_CURRENT_CHANGE = 1 << 5;
        /// Force Port Resume (FPR) - Bit 6
        const FORCE_PORT_RESUME = 1 << 6;
        /// Suspend (SUSP) - Bit 7
        const SUSPEND = 1 << 7;
        /// Port Reset (PR) - Bit 8
        const PORT_RESET = 1 << 8;
        /// Line Status - Bits [11:10]
        const LINE_STATUS_MASK = 0b11 << 10;
        const LINE_STATUS_SE0 = 0b00 << 10;
        const LINE_STATUS_K_STATE = 0b01 << 10;
        const LINE_STATUS_J_STATE = 0b10 << 10;
        /// Port Power (PP) - Bit 12
        const PORT_POWER = 1 << 12;
        /// Port Owner (PO) - Bit 13
        const PORT_OWNER = 1 << 13;
        /// Port Indicator Control - Bits [15:14]
        const PORT_INDICATOR_MASK = 0b11 << 14;
        const PORT_INDICATOR_OFF = 0b00 << 14;
        const PORT_INDICATOR_AMBER = 0b01 << 14;
        const PORT_INDICATOR_GREEN = 0b10 << 14;
        /// Port Test Control - Bits [19:16]
        const PORT_TEST_CONTROL_MASK = 0xF << 16;
        /// Wake on Connect Enable (WKCNNT_E) - Bit 20
        const WAKE_ON_CONNECT_ENABLE = 1 << 20;
        /// Wake on Disconnect Enable (WKDSCNNT_E) - Bit 21
        const WAKE_ON_DISCONNECT_ENABLE = 1 << 21;
        /// Wake on Over-current Enable (WKOC_E) - Bit 22
        const WAKE_ON_OVER_CURRENT_ENABLE = 1 << 22;
    }
}

impl PortSc {
    /// Write-1-to-clear change bits
    pub const CHANGE_BITS: Self = Self::CONNECT_STATUS_CHANGE
        .union(Self::PORT_ENABLE_CHANGE)
        .union(Self::OVER_CURRENT_CHANGE);
}

bitflags! {
    /// Host Controller Capability Parameters (HCCPARAMS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcCparams: u32 {
        /// 64-bit Addressing Capability (ADC) - Bit 0
        const ADDRESSING_64BIT = 1 << 0;
        /// Programmable Frame List Flag (PFL) - Bit 1
        const PROGRAMMABLE_FRAME_LIST = 1 << 1;
        /// Asynchronous Schedule Park Capability (ASP) - Bit 2
        const ASYNC_SCHEDULE_PARK = 1 << 2;
        /// Isochronous Scheduling Threshold (IST) - Bits [7:4]
        const ISOC_SCHEDULING_THRESHOLD_MASK = 0xF << 4;
        /// EHCI Extended Capabilities Pointer (EECP) - Bits [15:8]
        const EXTENDED_CAPABILITIES_POINTER_MASK = 0xFF << 8;
    }
}

bitflags! {
    /// Host Controller Structural Parameters (HCSPARAMS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcSparams: u32 {
        /// Number of Ports (N_PORTS) - Bits [3:0]
        const N_PORTS_MASK = 0xF;
        /// Port Power Control (PPC) - Bit 4
        const PORT_POWER_CONTROL = 1 << 4;
        /// Number of Ports per Companion Controller (N_PCC) - Bits [11:8]
        const N_PCC_MASK = 0xF << 8;
        /// Number of Companion Controllers (N_CC) - Bits [15:12]
        const N_CC_MASK = 0xF << 12;
        /// Port Indicators (P_INDICATOR) - Bit 16
        const PORT_INDICATORS = 1 << 16;
        /// Debug Port Number (DEBUG_PORT_NUMBER) - Bits [23:20]
        const DEBUG_PORT_NUMBER_MASK = 0xF << 20;
    }
}

/// Timeout constants per USB 2.0 specification
pub mod timeouts {
    /// Port reset assertion time (20ms minimum per USB 2.0 spec)
    pub const PORT_RESET_ASSERT_TIME_MS: u32 = 20;
    /// Time allowed for the port to enable after reset ends (EHCI requires 2ms)
    pub const PORT_RESET_RECOVERY_TIME_MS: u32 = 5;
    /// One full frame, the bound for the periodic walker to leave a queue head
    pub const FRAME_TIME_US: u32 = 1_000;
}

// Ensure proper alignment and size of register structures
const _: () = {
    assert!(core::mem::size_of::<CapabilityRegisters>() == 16);
    assert!(core::mem::align_of::<CapabilityRegisters>() == 4);
    assert!(core::mem::size_of::<OperationalRegisters>() == 0x44 + 4 * limits::MAX_PORTS);
    assert!(core::mem::align_of::<OperationalRegisters>() == 4);
};
