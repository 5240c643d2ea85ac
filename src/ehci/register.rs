//! Register and DMA-memory access with explicit ordering
//!
//! EHCI shares two kinds of memory with software: the memory-mapped register
//! block and the descriptors the controller walks by DMA. Both are accessed
//! here with barriers so that the order the driver writes in is the order the
//! controller observes.

use core::cell::UnsafeCell;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, UsbError};
use embedded_hal::delay::DelayNs;

/// Data memory barrier
#[inline(always)]
pub fn dmb() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Data synchronization barrier, waits for outstanding writes to complete
#[inline(always)]
pub fn dsb() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dsb();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Write a word of DMA-visible memory the controller may be reading right now
///
/// Everything written before this call is visible to the controller before
/// the new value is.
#[inline(always)]
pub fn write_ordered(cell: &AtomicU32, value: u32) {
    dmb();
    cell.store(value, Ordering::SeqCst);
    dsb();
}

/// Read a word of DMA-visible memory the controller may be writing
#[inline(always)]
pub fn read_ordered(cell: &AtomicU32) -> u32 {
    dmb();
    let value = cell.load(Ordering::SeqCst);
    dmb();
    value
}

/// Memory-mapped register with barriers around every access
#[repr(transparent)]
pub struct Register<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T> Send for Register<T> where T: Send {}
unsafe impl<T> Sync for Register<T> where T: Sync {}

impl Register<u32> {
    /// Create a new register wrapper
    pub const fn new(value: u32) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Read register with acquire semantics for status/data reads
    #[inline(always)]
    pub fn read(&self) -> u32 {
        dmb();
        // Safety: the cell is always initialized and only accessed volatilely
        let value = unsafe { read_volatile(self.value.get()) };
        dmb();
        value
    }

    /// Read register without barriers (capability registers, no side effects)
    #[inline(always)]
    pub fn read_relaxed(&self) -> u32 {
        // Safety: the cell is always initialized and only accessed volatilely
        unsafe { read_volatile(self.value.get()) }
    }

    /// Write register with release semantics for control writes
    #[inline(always)]
    pub fn write(&self, value: u32) {
        dmb();
        // Safety: the cell is always initialized and only accessed volatilely
        unsafe { write_volatile(self.value.get(), value) };
        dsb();
    }

    /// Read-modify-write with full barriers
    #[inline(always)]
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let current = self.read();
        self.write(f(current));
    }

    /// Set bits
    #[inline(always)]
    pub fn set_bits(&self, mask: u32) {
        self.modify(|v| v | mask);
    }

    /// Clear bits
    #[inline(always)]
    pub fn clear_bits(&self, mask: u32) {
        self.modify(|v| v & !mask);
    }

    /// Write-1-to-clear operation for status registers
    #[inline(always)]
    pub fn write_1_to_clear(&self, mask: u32) {
        self.write(mask);
    }
}

/// Bounded wait for a hardware condition
///
/// Time is measured by the delays handed to the caller's [`DelayNs`], so the
/// bound holds without a free-running timer.
#[derive(Debug, Clone, Copy)]
pub struct RegisterTimeout {
    timeout_us: u64,
    poll_interval_us: u32,
}

impl RegisterTimeout {
    /// Default interval between two checks of the condition
    pub const DEFAULT_POLL_INTERVAL_US: u32 = 10;

    /// Create new timeout with duration in microseconds
    pub const fn new_us(timeout_us: u64) -> Self {
        Self {
            timeout_us,
            poll_interval_us: Self::DEFAULT_POLL_INTERVAL_US,
        }
    }

    /// Create new timeout with duration in milliseconds
    pub const fn new_ms(timeout_ms: u32) -> Self {
        Self::new_us(timeout_ms as u64 * 1000)
    }

    /// Change how often the condition is checked
    pub const fn poll_interval_us(mut self, interval_us: u32) -> Self {
        self.poll_interval_us = if interval_us == 0 { 1 } else { interval_us };
        self
    }

    /// Wait for condition with timeout
    pub fn wait_for<D, F>(&self, delay: &mut D, mut condition: F) -> Result<()>
    where
        D: DelayNs,
        F: FnMut() -> bool,
    {
        let mut elapsed = self.start();
        while !condition() {
            if !self.tick(delay, &mut elapsed) {
                return Err(UsbError::Timeout);
            }
        }

        Ok(())
    }

    /// Begin a manually driven wait, see [`RegisterTimeout::tick`]
    pub const fn start(&self) -> u64 {
        0
    }

    /// Sleep one poll interval; returns `false` once the budget is spent
    pub fn tick<D: DelayNs>(&self, delay: &mut D, elapsed_us: &mut u64) -> bool {
        if *elapsed_us >= self.timeout_us {
            return false;
        }

        delay.delay_us(self.poll_interval_us);
        *elapsed_us += self.poll_interval_us as u64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDelay {
        total_ns: u64,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += ns as u64;
        }
    }

    #[test]
    fn test_register_read_write() {
        let reg = Register::new(0);
        reg.write(0x1234);
        assert_eq!(reg.read(), 0x1234);
        reg.set_bits(0x1);
        assert_eq!(reg.read(), 0x1235);
        reg.clear_bits(0x1004);
        assert_eq!(reg.read(), 0x0231);
    }

    #[test]
    fn test_write_ordered() {
        let cell = AtomicU32::new(0);
        write_ordered(&cell, 0xDEAD_BEE0);
        assert_eq!(read_ordered(&cell), 0xDEAD_BEE0);
    }

    #[test]
    fn test_timeout_expires() {
        let mut delay = CountingDelay { total_ns: 0 };
        let result = RegisterTimeout::new_us(100).wait_for(&mut delay, || false);
        assert_eq!(result, Err(UsbError::Timeout));
        assert_eq!(delay.total_ns, 100_000);
    }

    #[test]
    fn test_timeout_condition_met() {
        let mut delay = CountingDelay { total_ns: 0 };
        let mut polls = 0;
        let result = RegisterTimeout::new_ms(1).wait_for(&mut delay, || {
            polls += 1;
            polls == 3
        });
        assert!(result.is_ok());
        assert_eq!(delay.total_ns, 20_000);
    }
}
