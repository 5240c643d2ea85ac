//! Taking the asynchronous ring over from a boot-time debugger
//!
//! A debugger that talks over the controller's debug port keeps its own two
//! queue heads on the asynchronous ring: a reclamation head and an end queue.
//! When the driver starts, its list head replaces the end queue so the
//! debugger's transfers and the driver's share a single ring.

use core::sync::atomic::Ordering;

use super::qh::{link, QueueHead};

/// Queue heads owned by a debugger on the asynchronous ring
pub struct DebugHandoff {
    /// Head the debugger's ring starts at; it is left in place
    pub reclamation_queue: &'static QueueHead,
    /// Current end of the ring
    pub end_queue: &'static QueueHead,
    /// Physical address of `end_queue`
    pub end_queue_physical: u32,
    /// Tears down the debugger's use of the port, if it needs telling
    pub disconnect: Option<fn()>,
}

impl DebugHandoff {
    /// Describe a debugger ring
    pub const fn new(
        reclamation_queue: &'static QueueHead,
        end_queue: &'static QueueHead,
        end_queue_physical: u32,
    ) -> Self {
        Self {
            reclamation_queue,
            end_queue,
            end_queue_physical,
            disconnect: None,
        }
    }

    /// Hook run before the ring changes hands and when the driver stops
    pub const fn with_disconnect(mut self, disconnect: fn()) -> Self {
        self.disconnect = Some(disconnect);
        self
    }

    /// Make `head` the end queue of the debugger's ring
    ///
    /// `head` inherits the old end queue's link and characteristics, then the
    /// reclamation queue is pointed at it.
    pub fn splice(&mut self, head: &'static QueueHead, head_physical: u32) {
        if let Some(disconnect) = self.disconnect {
            disconnect();
        }

        head.horizontal_link
            .store(self.end_queue.horizontal(), Ordering::Relaxed);
        head.endpoint_chars.store(
            self.end_queue.endpoint_chars.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.reclamation_queue
            .set_horizontal(link::queue_head(head_physical));

        self.end_queue = head;
        self.end_queue_physical = head_physical;

        #[cfg(feature = "defmt")]
        defmt::info!("EHCI: took over debugger ring, end queue {:#x}", head_physical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::qh::endpoint;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn leak() -> &'static QueueHead {
        Box::leak(Box::new(QueueHead::new()))
    }

    fn physical(head: &QueueHead) -> u32 {
        head as *const QueueHead as usize as u32
    }

    #[test]
    fn test_splice_replaces_end_queue() {
        let reclamation = leak();
        let end = leak();
        reclamation.set_horizontal(link::queue_head(physical(end)));
        end.set_horizontal(link::queue_head(physical(reclamation)));
        end.endpoint_chars
            .store(endpoint::HEAD_OF_LIST | 0x12, Ordering::Relaxed);

        let mut handoff = DebugHandoff::new(reclamation, end, physical(end));
        let head = leak();
        head.init_empty(endpoint::HEAD_OF_LIST);
        handoff.splice(head, physical(head));

        assert_eq!(reclamation.horizontal(), link::queue_head(physical(head)));
        assert_eq!(head.horizontal(), link::queue_head(physical(reclamation)));
        assert_eq!(
            head.endpoint_chars.load(Ordering::Relaxed),
            endpoint::HEAD_OF_LIST | 0x12
        );
        assert_eq!(handoff.end_queue_physical, physical(head));
    }

    static DISCONNECTS: AtomicUsize = AtomicUsize::new(0);

    fn count_disconnect() {
        DISCONNECTS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_splice_disconnects_debugger() {
        let reclamation = leak();
        let end = leak();
        let mut handoff =
            DebugHandoff::new(reclamation, end, physical(end)).with_disconnect(count_disconnect);

        let head = leak();
        handoff.splice(head, physical(head));
        assert_eq!(DISCONNECTS.load(Ordering::SeqCst), 1);
    }
}
