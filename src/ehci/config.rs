//! Controller configuration
//!
//! Everything the driver would otherwise read from global tunables is fixed
//! at construction time through [`EhciConfig`].

use bitflags::bitflags;

use super::limits::MAX_PORTS;
use super::UsbCmd;
use crate::error::{Result, UsbError};

bitflags! {
    /// Verbose tracing switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Trace root hub port status
        const PORTS = 1 << 0;
        /// Trace every submitted and completed descriptor
        const TRANSFERS = 1 << 1;
        /// Trace descriptors that finish with an error
        const ERRORS = 1 << 2;
    }
}

/// Host controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhciConfig {
    /// Verbose tracing switches
    pub debug: DebugFlags,
    /// Maximum interrupt rate in micro-frames (1, 2, 4, 8, 16, 32 or 64)
    pub interrupt_threshold: u8,
    /// Asynchronous park mode count, 0 disables park mode
    pub async_park_count: u8,
    /// Bound on each descriptor of a polled transfer
    pub polled_timeout_ms: u32,
    /// Bound on an endpoint flush
    pub flush_timeout_ms: u32,
    /// Bound on the host controller reset handshake
    pub reset_timeout_ms: u32,
    /// Root hub ports to manage
    pub port_count: u8,
}

impl Default for EhciConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::empty(),
            interrupt_threshold: 8,
            async_park_count: 3,
            polled_timeout_ms: 10_000,
            flush_timeout_ms: 10_000,
            reset_timeout_ms: 250,
            port_count: 1,
        }
    }
}

impl EhciConfig {
    /// Start from the defaults
    pub fn builder() -> EhciConfigBuilder {
        EhciConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the configuration against what the hardware can express
    pub fn validate(&self) -> Result<()> {
        if self.port_count == 0 || self.port_count as usize > MAX_PORTS {
            return Err(UsbError::InvalidConfiguration);
        }

        if !self.interrupt_threshold.is_power_of_two() || self.interrupt_threshold > 64 {
            return Err(UsbError::InvalidConfiguration);
        }

        if self.async_park_count > 3 {
            return Err(UsbError::InvalidConfiguration);
        }

        Ok(())
    }

    /// USBCMD value that starts the controller with this configuration
    pub fn run_command(&self) -> UsbCmd {
        let mut command = UsbCmd::RUN_STOP
            | UsbCmd::FRAME_LIST_SIZE_1024
            | UsbCmd::PERIODIC_SCHEDULE_ENABLE
            | UsbCmd::ASYNC_SCHEDULE_ENABLE;

        command |= UsbCmd::from_bits_retain(
            (self.interrupt_threshold as u32) << UsbCmd::INTERRUPT_THRESHOLD_SHIFT,
        );

        if self.async_park_count != 0 {
            command |= UsbCmd::ASYNC_PARK_MODE_ENABLE;
            command |= UsbCmd::from_bits_retain(
                (self.async_park_count as u32) << UsbCmd::ASYNC_PARK_MODE_COUNT_SHIFT,
            );
        }

        command
    }
}

/// Builder for [`EhciConfig`]
#[derive(Debug, Clone, Copy)]
pub struct EhciConfigBuilder {
    config: EhciConfig,
}

impl EhciConfigBuilder {
    /// Set tracing switches
    pub const fn debug(mut self, debug: DebugFlags) -> Self {
        self.config.debug = debug;
        self
    }

    /// Set interrupt threshold (microframes)
    pub const fn interrupt_threshold(mut self, threshold: u8) -> Self {
        self.config.interrupt_threshold = threshold;
        self
    }

    /// Set the async park mode count (0 disables park mode)
    pub const fn async_park_count(mut self, count: u8) -> Self {
        self.config.async_park_count = count;
        self
    }

    /// Set the per-descriptor polled transfer bound
    pub const fn polled_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.config.polled_timeout_ms = timeout_ms;
        self
    }

    /// Set the endpoint flush bound
    pub const fn flush_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.config.flush_timeout_ms = timeout_ms;
        self
    }

    /// Set the host controller reset bound
    pub const fn reset_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.config.reset_timeout_ms = timeout_ms;
        self
    }

    /// Set the number of root hub ports
    pub const fn port_count(mut self, port_count: u8) -> Self {
        self.config.port_count = port_count;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<EhciConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_run_command() {
        let command = EhciConfig::default().run_command();

        assert!(command.contains(UsbCmd::RUN_STOP));
        assert!(command.contains(UsbCmd::ASYNC_SCHEDULE_ENABLE | UsbCmd::PERIODIC_SCHEDULE_ENABLE));
        assert!(command.contains(UsbCmd::ASYNC_PARK_MODE_ENABLE));
        assert_eq!(command.bits() & UsbCmd::INTERRUPT_THRESHOLD_MASK.bits(), 8 << 16);
        assert_eq!(command.bits() & UsbCmd::ASYNC_PARK_MODE_COUNT_MASK.bits(), 3 << 8);
        assert_eq!(command.bits() & UsbCmd::FRAME_LIST_SIZE_MASK.bits(), 0);
    }

    #[test]
    fn test_park_mode_disabled() {
        let config = EhciConfig::builder().async_park_count(0).build().unwrap();
        assert!(!config.run_command().contains(UsbCmd::ASYNC_PARK_MODE_ENABLE));
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(
            EhciConfig::builder().port_count(0).build(),
            Err(UsbError::InvalidConfiguration)
        );
        assert_eq!(
            EhciConfig::builder().port_count(16).build(),
            Err(UsbError::InvalidConfiguration)
        );
        assert_eq!(
            EhciConfig::builder().interrupt_threshold(3).build(),
            Err(UsbError::InvalidConfiguration)
        );

        let config = EhciConfig::builder()
            .port_count(4)
            .debug(DebugFlags::ERRORS)
            .flush_timeout_ms(50)
            .build()
            .unwrap();
        assert_eq!(config.port_count, 4);
        assert_eq!(config.flush_timeout_ms, 50);
        assert!(config.debug.contains(DebugFlags::ERRORS));
    }
}
