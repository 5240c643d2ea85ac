//! Hand-off of status bits from the interrupt handler to deferred work

use core::sync::atomic::{AtomicU32, Ordering};

use super::UsbSts;

/// Status bits claimed by the interrupt handler and not yet serviced
///
/// The interrupt handler ORs bits in; the deferred handler swaps the word to
/// zero, so bits raised while it runs are kept for the next pass.
#[derive(Debug, Default)]
pub struct PendingStatus {
    bits: AtomicU32,
}

impl PendingStatus {
    /// Nothing pending
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Add bits read from USBSTS
    pub fn accumulate(&self, status: UsbSts) {
        self.bits.fetch_or(status.bits(), Ordering::AcqRel);
    }

    /// Claim everything accumulated so far
    pub fn take(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.bits.swap(0, Ordering::AcqRel))
    }

    /// Peek without claiming
    pub fn peek(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.bits.load(Ordering::Acquire))
    }
}
