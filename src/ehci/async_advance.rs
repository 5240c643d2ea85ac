//! Interrupt-on-async-advance doorbell bookkeeping
//!
//! A queue head unlinked from the asynchronous ring may still be cached by
//! the controller. Ringing the doorbell asks the controller to interrupt once
//! it no longer holds a reference to anything unlinked before the ring. Only
//! one doorbell is outstanding at a time: queues unlinked before the ring sit
//! on the ready list, queues unlinked after it wait on the pending list for
//! the next ring.

use heapless::Vec;

use super::limits::MAX_ENDPOINTS;
use crate::transfer::EndpointHandle;

/// Queues waiting on a doorbell
pub type QueueList = Vec<EndpointHandle, MAX_ENDPOINTS>;

/// What the caller must do after staging a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staged {
    /// Doorbell ring the queue waits for
    pub generation: u32,
    /// The doorbell has to be rung now
    pub ring: bool,
}

/// Ready and pending lists plus the ring counter
#[derive(Debug, Default)]
pub struct AsyncAdvance {
    ready: QueueList,
    pending: QueueList,
    generation: u32,
}

impl AsyncAdvance {
    /// No queue staged, no doorbell outstanding
    pub const fn new() -> Self {
        Self {
            ready: Vec::new(),
            pending: Vec::new(),
            generation: 0,
        }
    }

    /// Stage a queue that was just unlinked
    ///
    /// Capacity matches the endpoint table, so an endpoint can always be
    /// staged.
    pub fn stage(&mut self, endpoint: EndpointHandle) -> Staged {
        if self.ready.is_empty() {
            let _ = self.ready.push(endpoint);
            Staged {
                generation: self.generation,
                ring: true,
            }
        } else {
            let _ = self.pending.push(endpoint);
            Staged {
                generation: self.generation.wrapping_add(1),
                ring: false,
            }
        }
    }

    /// The doorbell fired: hand back the queues now clear of the hardware
    ///
    /// Pending queues become ready; the returned flag says the doorbell must
    /// be rung again for them.
    pub fn advance(&mut self) -> (QueueList, bool) {
        let released = core::mem::take(&mut self.ready);
        self.generation = self.generation.wrapping_add(1);
        self.ready = core::mem::take(&mut self.pending);
        let ring = !self.ready.is_empty();

        (released, ring)
    }

    /// Current doorbell generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Check if a doorbell is outstanding
    pub fn is_waiting(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Queues staged on either list
    pub fn staged(&self) -> usize {
        self.ready.len() + self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_stage_rings() {
        let mut doorbell = AsyncAdvance::new();
        let staged = doorbell.stage(EndpointHandle(1));

        assert!(staged.ring);
        assert_eq!(staged.generation, 0);
        assert!(doorbell.is_waiting());
    }

    #[test]
    fn test_second_stage_waits_for_next_ring() {
        let mut doorbell = AsyncAdvance::new();
        doorbell.stage(EndpointHandle(1));
        let staged = doorbell.stage(EndpointHandle(2));
        assert!(!staged.ring);
        assert_eq!(staged.generation, 1);

        let (released, ring) = doorbell.advance();
        assert_eq!(&released[..], &[EndpointHandle(1)]);
        assert!(ring);
        assert_eq!(doorbell.generation(), 1);

        let (released, ring) = doorbell.advance();
        assert_eq!(&released[..], &[EndpointHandle(2)]);
        assert!(!ring);
        assert_eq!(doorbell.staged(), 0);
    }

    #[test]
    fn test_spurious_advance() {
        let mut doorbell = AsyncAdvance::new();
        let (released, ring) = doorbell.advance();

        assert!(released.is_empty());
        assert!(!ring);
    }
}
