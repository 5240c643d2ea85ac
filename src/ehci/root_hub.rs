//! Root hub port status
//!
//! The USB core sees the controller's ports as a hub. This module translates
//! between the PORTSC registers and the software port status the core works
//! with, and runs the port reset sequence.
//!
//! Low-speed devices, and full-speed devices that fail to enable after a
//! reset, are released to the companion controller.

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;

use super::config::DebugFlags;
use super::limits::MAX_PORTS;
use super::timeouts::{PORT_RESET_ASSERT_TIME_MS, PORT_RESET_RECOVERY_TIME_MS};
use super::{OperationalRegisters, PortSc};
use crate::transfer::DeviceSpeed;

bitflags! {
    /// Software port status; the same bits flag changes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatusFlags: u16 {
        /// A device is attached and owned by this controller
        const CONNECTED = 1 << 0;
        /// The port is enabled
        const ENABLED = 1 << 1;
        /// The port is suspended
        const SUSPENDED = 1 << 2;
        /// Over-current condition
        const OVER_CURRENT = 1 << 3;
        /// Reset in progress
        const RESET = 1 << 4;
    }
}

/// Status of one root hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    /// Speed of the attached device
    pub speed: Option<DeviceSpeed>,
    /// Current state
    pub status: PortStatusFlags,
    /// Outstanding changes; also the requests passed to a set
    pub change: PortStatusFlags,
}

/// Software view of all root hub ports
#[derive(Debug, Clone)]
pub struct RootHubStatus {
    ports: [PortStatus; MAX_PORTS],
    port_count: usize,
}

impl RootHubStatus {
    /// Status for `port_count` ports, clamped to what PORTSC can address
    pub fn new(port_count: u8) -> Self {
        Self {
            ports: [PortStatus::default(); MAX_PORTS],
            port_count: (port_count as usize).min(MAX_PORTS),
        }
    }

    /// Number of ports tracked
    pub fn port_count(&self) -> usize {
        self.port_count
    }

    /// All tracked ports
    pub fn ports(&self) -> &[PortStatus] {
        &self.ports[..self.port_count]
    }

    /// All tracked ports, mutably
    pub fn ports_mut(&mut self) -> &mut [PortStatus] {
        &mut self.ports[..self.port_count]
    }

    /// One port by index
    pub fn port(&self, index: usize) -> Option<&PortStatus> {
        self.ports().get(index)
    }

    /// One port by index, mutably
    pub fn port_mut(&mut self, index: usize) -> Option<&mut PortStatus> {
        self.ports_mut().get_mut(index)
    }
}

/// Refresh `hub` from the port registers
///
/// Connect and over-current changes are acknowledged in hardware once they
/// have been folded into the software change bits.
#[cfg_attr(not(feature = "defmt"), allow(unused_variables))]
pub fn get_status(
    regs: &OperationalRegisters,
    hub: &mut RootHubStatus,
    port_count: usize,
    debug: DebugFlags,
) {
    for (index, port) in hub.ports_mut().iter_mut().take(port_count).enumerate() {
        let register = &regs.portsc[index];
        let mut hardware = PortSc::from_bits_retain(register.read());
        let mut status = PortStatusFlags::empty();

        if hardware.contains(PortSc::CURRENT_CONNECT_STATUS)
            && !hardware.contains(PortSc::PORT_OWNER)
        {
            if hardware.intersection(PortSc::LINE_STATUS_MASK) == PortSc::LINE_STATUS_K_STATE {
                // Low speed, give it to the companion controller
                port.speed = Some(DeviceSpeed::Low);
                register.write(
                    hardware
                        .difference(PortSc::CHANGE_BITS)
                        .union(PortSc::PORT_OWNER)
                        .bits(),
                );
                hardware = PortSc::empty();
            } else {
                status |= PortStatusFlags::CONNECTED;
                port.speed = Some(DeviceSpeed::High);
            }
        }

        if hardware.contains(PortSc::PORT_ENABLED) {
            status |= PortStatusFlags::ENABLED;
        }
        if hardware.contains(PortSc::PORT_RESET) {
            status |= PortStatusFlags::RESET;
        }
        if hardware.contains(PortSc::OVER_CURRENT_ACTIVE) {
            status |= PortStatusFlags::OVER_CURRENT;
        }

        port.change |= status ^ port.status;
        port.status = status;

        let preserved = hardware.difference(PortSc::CHANGE_BITS);
        if hardware.contains(PortSc::OVER_CURRENT_CHANGE) {
            port.change |= PortStatusFlags::OVER_CURRENT;
            register.write(preserved.union(PortSc::OVER_CURRENT_CHANGE).bits());
        }

        if hardware.contains(PortSc::CONNECT_STATUS_CHANGE) {
            port.change |= PortStatusFlags::CONNECTED;
            // A reset in progress owns the connect change
            if !hardware.contains(PortSc::PORT_RESET) {
                register.write(preserved.union(PortSc::CONNECT_STATUS_CHANGE).bits());
            }
        }

        #[cfg(feature = "defmt")]
        if debug.contains(DebugFlags::PORTS) {
            defmt::debug!(
                "EHCI: port {} status {:#x}, connected {}, owner {}, enabled {}, reset {}",
                index,
                hardware.bits(),
                hardware.contains(PortSc::CURRENT_CONNECT_STATUS),
                hardware.contains(PortSc::PORT_OWNER),
                hardware.contains(PortSc::PORT_ENABLED),
                hardware.contains(PortSc::PORT_RESET)
            );
        }
    }
}

/// Apply the changes requested in `hub`
///
/// Each handled request has its change bit cleared. A reset request runs the
/// full reset sequence before returning.
pub fn set_status<D: DelayNs>(
    regs: &OperationalRegisters,
    hub: &mut RootHubStatus,
    port_count: usize,
    delay: &mut D,
) {
    for (index, port) in hub.ports_mut().iter_mut().take(port_count).enumerate() {
        if port.change.is_empty() {
            continue;
        }

        let register = &regs.portsc[index];
        let original = PortSc::from_bits_retain(register.read()).difference(PortSc::CHANGE_BITS);

        // Nothing to do on a companion-owned port unless taking it back
        if original.contains(PortSc::PORT_OWNER) && !port.status.contains(PortStatusFlags::RESET) {
            port.change.remove(
                PortStatusFlags::RESET | PortStatusFlags::ENABLED | PortStatusFlags::SUSPENDED,
            );
            continue;
        }

        let reset_requested = port.change.contains(PortStatusFlags::RESET)
            && port.status.contains(PortStatusFlags::RESET);
        let keep_enabled = !port.change.contains(PortStatusFlags::ENABLED) && !reset_requested;

        let mut hardware = original.difference(
            PortSc::PORT_ENABLED
                | PortSc::PORT_RESET
                | PortSc::SUSPEND
                | PortSc::PORT_INDICATOR_MASK
                | PortSc::PORT_OWNER,
        );

        // Writing zero to the enable bit disables the port
        if keep_enabled && original.contains(PortSc::PORT_ENABLED) {
            hardware |= PortSc::PORT_ENABLED;
        }

        if port.change.contains(PortStatusFlags::ENABLED) {
            if port.status.contains(PortStatusFlags::ENABLED) {
                hardware |=
                    PortSc::PORT_ENABLED | PortSc::PORT_INDICATOR_GREEN | PortSc::PORT_POWER;
            }
            port.change.remove(PortStatusFlags::ENABLED);
        }

        // Reset and enable are mutually exclusive; high-speed ports enable
        // themselves when the reset ends
        if port.change.contains(PortStatusFlags::RESET) {
            if reset_requested {
                hardware |= PortSc::PORT_RESET;
                hardware.remove(PortSc::PORT_ENABLED);
            }
            port.change.remove(PortStatusFlags::RESET);
        }

        if port.change.contains(PortStatusFlags::SUSPENDED) {
            if port.status.contains(PortStatusFlags::SUSPENDED) {
                hardware |= PortSc::SUSPEND;
            }
            port.change.remove(PortStatusFlags::SUSPENDED);
        }

        if hardware != original {
            register.write(hardware.bits());
        }

        if hardware.contains(PortSc::PORT_RESET) {
            reset_port(register, delay);
        }
    }
}

fn reset_port<D: DelayNs>(register: &super::Register<u32>, delay: &mut D) {
    delay.delay_ms(PORT_RESET_ASSERT_TIME_MS);
    let current = PortSc::from_bits_retain(register.read()).difference(PortSc::CHANGE_BITS);
    register.write(current.difference(PortSc::PORT_RESET).bits());

    delay.delay_ms(PORT_RESET_RECOVERY_TIME_MS);
    let current = PortSc::from_bits_retain(register.read()).difference(PortSc::CHANGE_BITS);
    if !current.contains(PortSc::PORT_ENABLED) {
        // Not high speed
        register.write(current.union(PortSc::PORT_OWNER).bits());

        #[cfg(feature = "defmt")]
        defmt::info!("EHCI: port did not enable after reset, released to companion");
    }
}
