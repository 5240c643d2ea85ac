//! Software mirror of the hardware schedule
//!
//! [`Schedule`] owns every endpoint, transfer set and descriptor record and
//! keeps them consistent with the queue heads and descriptors the controller
//! walks by DMA. All methods run with the controller lock held and never
//! wait; anything that needs time to pass (a frame boundary, the async
//! advance doorbell) is split into a begin step and a finish step driven by
//! [`EhciController`](super::EhciController).
//!
//! # Queue discipline
//!
//! Each queue ends in a halted placeholder descriptor. Submitting a set
//! programs its descriptors ending at the original first descriptor, copies
//! the first descriptor into the placeholder and activates it last, so the
//! controller sees the whole chain appear at once. The emptied first
//! descriptor becomes the new placeholder.

use core::sync::atomic::{AtomicU32, Ordering};

use heapless::Vec;

use super::async_advance::AsyncAdvance;
use super::config::DebugFlags;
use super::endpoint::{
    characteristics, split_information, Endpoint, Placement, QueueState, TransferQueue,
};
use super::handoff::DebugHandoff;
use super::limits::{
    MAX_DESCRIPTORS_PER_SET, MAX_ENDPOINTS, MAX_ENDPOINT_TRANSFERS, MAX_TRANSFERS,
    MAX_TRANSFER_SETS,
};
use super::periodic::{PeriodicFrameList, TREE_DEPTH};
use super::qh::{endpoint as queue_endpoint, link};
use super::qtd::{token, token_error};
use super::register::write_ordered;
use super::slab::Slab;
use super::transfer_set::{
    program_descriptor, reserved_descriptor_count, stage_token, submission_count, SetFlags,
    StagePlan, Transfer, TransferId, TransferSet,
};
use super::{OperationalRegisters, UsbCmd};
use crate::dma::{DescriptorAllocator, QhHandle};
use crate::error::{Result, TransferError, UsbError};
use crate::transfer::{
    EndpointHandle, EndpointRequest, TransferCompletion, TransferFlags, TransferHandle,
    TransferRequest, TransferType,
};

/// Completions gathered under the lock and delivered after it is released
pub type Completions = Vec<TransferCompletion, MAX_TRANSFER_SETS>;

type EndpointList = Vec<EndpointHandle, MAX_ENDPOINTS>;

/// Snapshot of the schedule occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScheduleStats {
    /// Endpoints created and not yet destroyed
    pub endpoints: usize,
    /// Endpoint queue heads still in service
    pub live_queue_heads: usize,
    /// Queue heads unlinked by a destroy and not yet released
    pub pending_destruction: usize,
    /// Descriptors the controller may still be working on
    pub in_flight_descriptors: usize,
}

/// What is left to do after [`Schedule::begin_destroy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStep {
    /// Nothing, the endpoint is gone or already on its way out
    Done,
    /// Wait one frame, then [`Schedule::release_endpoint`]
    WaitFrame,
    /// The async advance interrupt queues the endpoint for destroy work
    Deferred,
}

/// What is left to do after [`Schedule::begin_cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStep {
    /// The async advance interrupt finishes the cancel
    Pending,
    /// Wait one frame, then [`Schedule::finish_periodic_cancel`]
    WaitFrame(EndpointHandle),
}

/// Progress of a polled transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Still running; `progressed` is set when a descriptor finished
    Running {
        /// At least one descriptor was retired on this pass
        progressed: bool,
    },
    /// The set left the schedule with this outcome
    Finished(Result<u32>),
}

/// Endpoint, transfer and descriptor bookkeeping for one controller
pub struct Schedule<A: DescriptorAllocator + 'static> {
    pool: &'static A,
    regs: &'static OperationalRegisters,
    #[cfg_attr(not(feature = "defmt"), allow(dead_code))]
    debug: DebugFlags,
    endpoints: Slab<Endpoint, MAX_ENDPOINTS>,
    sets: Slab<TransferSet, MAX_TRANSFER_SETS>,
    transfers: Slab<Transfer, MAX_TRANSFERS>,
    in_flight: Vec<TransferId, MAX_TRANSFERS>,
    anchors: [QhHandle; TREE_DEPTH],
    tree: [EndpointList; TREE_DEPTH],
    async_head: QhHandle,
    async_ring: EndpointList,
    doorbell: AsyncAdvance,
    destroy_list: EndpointList,
    endpoint_count: usize,
    command: UsbCmd,
}

impl<A: DescriptorAllocator + 'static> Schedule<A> {
    /// Allocate the periodic tree and the asynchronous list head
    ///
    /// The frame list is pointed at the tree. With a debugger hand-off the
    /// new list head takes the place of the debugger's end queue; otherwise
    /// it forms a ring of one.
    pub fn new(
        pool: &'static A,
        regs: &'static OperationalRegisters,
        frame_list: &PeriodicFrameList,
        handoff: Option<&mut DebugHandoff>,
        debug: DebugFlags,
    ) -> Result<Self> {
        let mut allocated: Vec<QhHandle, TREE_DEPTH> = Vec::new();
        for _ in 0..TREE_DEPTH {
            let Some(anchor) = pool.alloc_queue_head() else {
                for anchor in allocated {
                    pool.free_queue_head(anchor);
                }
                return Err(UsbError::NoResources);
            };

            pool.queue_head(anchor).init_empty(0);
            let _ = allocated.push(anchor);
        }

        let Some(async_head) = pool.alloc_queue_head() else {
            for anchor in allocated {
                pool.free_queue_head(anchor);
            }
            return Err(UsbError::NoResources);
        };

        let anchors: [QhHandle; TREE_DEPTH] = core::array::from_fn(|level| allocated[level]);
        let physical: [u32; TREE_DEPTH] =
            core::array::from_fn(|level| pool.queue_head_physical(anchors[level]));

        // Each level feeds into the next more frequent one
        for level in 1..TREE_DEPTH {
            pool.queue_head(anchors[level - 1]).set_horizontal(link::queue_head(physical[level]));
        }
        frame_list.build_tree(&physical);

        let head = pool.queue_head(async_head);
        let head_physical = pool.queue_head_physical(async_head);
        head.init_empty(queue_endpoint::HEAD_OF_LIST);
        match handoff {
            Some(handoff) => handoff.splice(head, head_physical),
            None => head.set_horizontal(link::queue_head(head_physical)),
        }

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "EHCI: schedule ready, frame list {:#x}, async head {:#x}",
            frame_list.base_address(),
            head_physical
        );

        Ok(Self {
            pool,
            regs,
            debug,
            endpoints: Slab::new(),
            sets: Slab::new(),
            transfers: Slab::new(),
            in_flight: Vec::new(),
            anchors,
            tree: core::array::from_fn(|_| Vec::new()),
            async_head,
            async_ring: Vec::new(),
            doorbell: AsyncAdvance::new(),
            destroy_list: Vec::new(),
            endpoint_count: 0,
            command: UsbCmd::empty(),
        })
    }

    /// Physical address of the asynchronous list head
    pub fn async_head_physical(&self) -> u32 {
        self.pool.queue_head_physical(self.async_head)
    }

    /// Remember the USBCMD value the controller runs with
    ///
    /// Ringing the doorbell rewrites USBCMD from this mirror.
    pub fn set_command(&mut self, command: UsbCmd) {
        self.command = command;
    }

    /// Occupancy counters
    pub fn stats(&self) -> ScheduleStats {
        let mut stats = ScheduleStats {
            endpoints: self.endpoint_count,
            in_flight_descriptors: self.in_flight.len(),
            ..ScheduleStats::default()
        };

        for (_, endpoint) in self.endpoints.iter() {
            if endpoint.queue.is_some() {
                if endpoint.destroying {
                    stats.pending_destruction += 1;
                } else {
                    stats.live_queue_heads += 1;
                }
            }
        }

        stats
    }

    // Endpoints

    /// Create an endpoint and link its queue head into the schedule
    pub fn create_endpoint(&mut self, request: &EndpointRequest) -> Result<EndpointHandle> {
        if request.endpoint_number > 15 || request.max_packet_size > 1024 {
            return Err(UsbError::InvalidParameter);
        }

        if self.endpoints.available() == 0 {
            return Err(UsbError::NoResources);
        }

        let mut endpoint = Endpoint::new(request);
        let has_queue = request.transfer_type != TransferType::Isochronous;
        if has_queue {
            endpoint.queue = Some(self.create_queue(request, endpoint.placement())?);
        }

        let handle = match self.endpoints.insert(endpoint) {
            Ok(index) => EndpointHandle(index as u16),
            Err(endpoint) => {
                if let Some(queue) = endpoint.queue {
                    self.free_queue(&queue);
                }
                return Err(UsbError::NoResources);
            }
        };

        self.endpoint_count += 1;
        if has_queue {
            self.link(handle);
        }

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "EHCI: created {} endpoint {} (handle {})",
            request.transfer_type,
            request.endpoint_number,
            handle.0
        );

        Ok(handle)
    }

    fn create_queue(
        &mut self,
        request: &EndpointRequest,
        placement: Placement,
    ) -> Result<TransferQueue> {
        let head = self.pool.alloc_queue_head().ok_or(UsbError::NoResources)?;
        let Some(descriptor) = self.pool.alloc_transfer_descriptor() else {
            self.pool.free_queue_head(head);
            return Err(UsbError::NoResources);
        };

        let descriptor_physical = self.pool.transfer_descriptor_physical(descriptor);
        self.pool.transfer_descriptor(descriptor).init_placeholder();
        let dummy = match self.transfers.insert(Transfer::new(descriptor, descriptor_physical, None)) {
            Ok(index) => TransferId(index as u16),
            Err(_) => {
                self.pool.free_transfer_descriptor(descriptor);
                self.pool.free_queue_head(head);
                return Err(UsbError::NoResources);
            }
        };

        self.pool.queue_head(head).init_endpoint(
            characteristics(request),
            split_information(request, self.endpoint_count),
            descriptor_physical,
        );

        Ok(TransferQueue {
            head,
            physical: self.pool.queue_head_physical(head),
            dummy,
            placement,
            state: QueueState::Unlinked,
            cancel_pending: false,
        })
    }

    fn free_queue(&mut self, queue: &TransferQueue) {
        if let Some(dummy) = self.transfers.remove(queue.dummy.index()) {
            self.pool.free_transfer_descriptor(dummy.descriptor);
        }
        self.pool.free_queue_head(queue.head);
    }

    fn queue(&self, handle: EndpointHandle) -> Option<&TransferQueue> {
        self.endpoints.get(handle.index())?.queue.as_ref()
    }

    fn queue_mut(&mut self, handle: EndpointHandle) -> Option<&mut TransferQueue> {
        self.endpoints.get_mut(handle.index())?.queue.as_mut()
    }

    /// Insert the queue head right after its anchor
    fn link(&mut self, handle: EndpointHandle) {
        let Some(queue) = self.queue(handle) else {
            return;
        };
        let (head, physical, placement) = (queue.head, queue.physical, queue.placement);

        let (anchor, list) = match placement {
            Placement::Asynchronous => (self.async_head, &mut self.async_ring),
            Placement::Periodic { level } => (self.anchors[level], &mut self.tree[level]),
        };

        let anchor = self.pool.queue_head(anchor);
        self.pool.queue_head(head).set_horizontal(anchor.horizontal());
        anchor.set_horizontal(link::queue_head(physical));
        let _ = list.insert(0, handle);

        if let Some(queue) = self.queue_mut(handle) {
            queue.state = QueueState::Linked;
        }
    }

    /// Take the queue head out of the hardware walk; the caller decides the
    /// new state
    fn unlink(&mut self, handle: EndpointHandle) {
        let Some(queue) = self.queue(handle) else {
            return;
        };
        let (head, placement) = (queue.head, queue.placement);

        let (anchor, list) = match placement {
            Placement::Asynchronous => (self.async_head, &mut self.async_ring),
            Placement::Periodic { level } => (self.anchors[level], &mut self.tree[level]),
        };

        let Some(position) = list.iter().position(|&linked| linked == handle) else {
            return;
        };

        let previous = if position == 0 {
            anchor
        } else {
            match self
                .endpoints
                .get(list[position - 1].index())
                .and_then(|endpoint| endpoint.queue.as_ref())
            {
                Some(queue) => queue.head,
                None => return,
            }
        };

        let next = self.pool.queue_head(head).horizontal();
        self.pool.queue_head(previous).set_horizontal(next);
        list.remove(position);
    }

    /// Put an unlinked async queue behind the doorbell
    fn stage(&mut self, handle: EndpointHandle) {
        let staged = self.doorbell.stage(handle);
        if let Some(queue) = self.queue_mut(handle) {
            queue.state = QueueState::PendingDoorbell {
                generation: staged.generation,
            };
        }

        if staged.ring {
            self.ring_doorbell();
        }
    }

    fn ring_doorbell(&self) {
        self.regs
            .usbcmd
            .write((self.command | UsbCmd::INTERRUPT_ON_ASYNC_ADVANCE).bits());
    }

    /// Change the max packet size of an idle endpoint and reset its toggle
    pub fn reset_endpoint(&mut self, handle: EndpointHandle, max_packet_size: u16) -> Result<()> {
        let endpoint = self
            .endpoints
            .get_mut(handle.index())
            .ok_or(UsbError::InvalidParameter)?;

        debug_assert!(endpoint.transfers.is_empty(), "reset of a busy endpoint");
        endpoint.max_packet_size = max_packet_size;

        if let Some(queue) = &endpoint.queue {
            let head = self.pool.queue_head(queue.head);
            if head.max_packet_size() != max_packet_size {
                head.set_max_packet_size(max_packet_size);
            }
            head.clear_data_toggle();
        }

        Ok(())
    }

    /// Start tearing an endpoint down
    pub fn begin_destroy(&mut self, handle: EndpointHandle) -> Result<DestroyStep> {
        let endpoint = self
            .endpoints
            .get_mut(handle.index())
            .ok_or(UsbError::InvalidParameter)?;

        if endpoint.destroying {
            return Ok(DestroyStep::Done);
        }

        debug_assert!(endpoint.transfers.is_empty(), "destroy of a busy endpoint");
        endpoint.destroying = true;
        self.endpoint_count -= 1;

        let Some(queue) = endpoint.queue.as_ref() else {
            self.endpoints.remove(handle.index());
            return Ok(DestroyStep::Done);
        };

        match (queue.placement, queue.state) {
            (Placement::Periodic { .. }, state) => {
                if state == QueueState::Linked {
                    self.unlink(handle);
                }
                if let Some(queue) = self.queue_mut(handle) {
                    queue.state = QueueState::Unlinked;
                }
                Ok(DestroyStep::WaitFrame)
            }
            (Placement::Asynchronous, QueueState::Linked) => {
                self.unlink(handle);
                self.stage(handle);
                Ok(DestroyStep::Deferred)
            }
            // Already behind the doorbell for a cancel; the release sees the
            // destroying flag
            (Placement::Asynchronous, _) => Ok(DestroyStep::Deferred),
        }
    }

    /// Free an endpoint the hardware no longer references
    pub fn release_endpoint(&mut self, handle: EndpointHandle) {
        if let Some(endpoint) = self.endpoints.remove(handle.index()) {
            if let Some(queue) = endpoint.queue {
                self.free_queue(&queue);
            }
        }
    }

    /// Free every endpoint queued by the async advance handler
    pub fn destroy_queued_endpoints(&mut self) -> usize {
        let queued = core::mem::take(&mut self.destroy_list);
        for &handle in &queued {
            self.release_endpoint(handle);
        }

        queued.len()
    }

    // Transfer sets

    /// Reserve descriptors for transfers of up to `max_buffer_size` bytes
    pub fn create_transfer(
        &mut self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle> {
        let owner = self
            .endpoints
            .get(endpoint.index())
            .filter(|owner| !owner.destroying)
            .ok_or(UsbError::InvalidParameter)?;

        let count = reserved_descriptor_count(
            owner.transfer_type,
            max_buffer_size,
            owner.max_packet_size,
            flags,
        )?;

        if count > MAX_DESCRIPTORS_PER_SET
            || self.sets.available() == 0
            || self.transfers.available() < count
        {
            return Err(UsbError::NoResources);
        }

        let set = TransferSet::new(endpoint, owner.transfer_type, max_buffer_size);
        let index = self.sets.insert(set).map_err(|_| UsbError::NoResources)?;
        let handle = TransferHandle(index as u16);

        for _ in 0..count {
            let Some(descriptor) = self.pool.alloc_transfer_descriptor() else {
                self.free_set(handle);
                return Err(UsbError::NoResources);
            };

            let physical = self.pool.transfer_descriptor_physical(descriptor);
            let id = match self.transfers.insert(Transfer::new(descriptor, physical, Some(handle))) {
                Ok(index) => TransferId(index as u16),
                Err(_) => {
                    self.pool.free_transfer_descriptor(descriptor);
                    self.free_set(handle);
                    return Err(UsbError::NoResources);
                }
            };

            let _ = self.sets[index].transfers.push(id);
        }

        Ok(handle)
    }

    fn free_set(&mut self, handle: TransferHandle) {
        let Some(set) = self.sets.remove(handle.index()) else {
            return;
        };

        for id in set.transfers {
            if let Some(transfer) = self.transfers.remove(id.index()) {
                self.pool.free_transfer_descriptor(transfer.descriptor);
            }
        }
    }

    /// Release a set that is not queued
    pub fn destroy_transfer(&mut self, handle: TransferHandle) -> Result<()> {
        let set = self.sets.get(handle.index()).ok_or(UsbError::InvalidParameter)?;
        if set.is_queued() {
            return Err(UsbError::InvalidState);
        }

        self.free_set(handle);
        Ok(())
    }

    /// Program a set's descriptors and make them visible to the controller
    pub fn submit(&mut self, handle: TransferHandle, request: &TransferRequest) -> Result<()> {
        let set = self.sets.get(handle.index()).ok_or(UsbError::InvalidParameter)?;
        if set.is_queued() {
            return Err(UsbError::InvalidState);
        }

        let endpoint_handle = set.endpoint;
        let endpoint = self
            .endpoints
            .get(endpoint_handle.index())
            .ok_or(UsbError::InvalidParameter)?;
        if endpoint.destroying {
            return Err(UsbError::InvalidState);
        }

        let Some(queue) = endpoint.queue.as_ref() else {
            return Err(UsbError::NotImplemented);
        };

        if request.length > set.max_buffer_size {
            return Err(UsbError::InvalidParameter);
        }

        let transfer_type = endpoint.transfer_type;
        let count = submission_count(transfer_type, request, endpoint.max_packet_size)?;
        if count > set.transfers.len() {
            return Err(UsbError::InvalidParameter);
        }

        if endpoint.transfers.len() + count > MAX_ENDPOINT_TRANSFERS {
            return Err(UsbError::NoResources);
        }

        let head = self.pool.queue_head(queue.head);
        if head.device_address() != request.device_address {
            debug_assert!(
                endpoint.transfers.is_empty(),
                "device address changed with transfers queued"
            );
            head.set_device_address(request.device_address);
        }
        let (queue_head, dummy) = (queue.head, queue.dummy);

        let set = &mut self.sets[handle.index()];
        set.begin(*request, count);
        let ids: Vec<TransferId, MAX_DESCRIPTORS_PER_SET> =
            set.active_transfers().iter().copied().collect();

        let control = transfer_type == TransferType::Control;
        let first_physical = self.transfers[ids[0].index()].physical;
        let status_physical = control.then(|| self.transfers[ids[count - 1].index()].physical);
        let interrupt = !request.flags.contains(TransferFlags::NO_INTERRUPT_ON_COMPLETION);
        let mut toggle = false;
        let mut previous: Option<TransferId> = None;

        for (index, stage) in StagePlan::new(transfer_type, request, count).enumerate() {
            let id = ids[index];
            let last = index == count - 1;

            let record = &mut self.transfers[id.index()];
            record.length = stage.length;
            record.last = last;
            record.queued = true;
            let (descriptor, physical) = (record.descriptor, record.physical);

            // Short packets skip ahead to the status stage, or to the end
            let alt_next = match status_physical {
                Some(status) if !last => status,
                _ => first_physical,
            };

            let value = stage_token(&stage, request.direction, control, &mut toggle, last && interrupt);
            program_descriptor(
                self.pool.transfer_descriptor(descriptor),
                request.buffer_physical,
                &stage,
                value,
                first_physical,
                alt_next,
            );

            if let Some(previous) = previous {
                let previous = self.transfers[previous.index()].descriptor;
                self.pool
                    .transfer_descriptor(previous)
                    .next_qtd
                    .store(physical, Ordering::Relaxed);
            }
            previous = Some(id);

            let _ = self.endpoints[endpoint_handle.index()].transfers.push(id);
            let _ = self.in_flight.push(id);

            #[cfg(feature = "defmt")]
            if self.debug.contains(DebugFlags::TRANSFERS) {
                defmt::debug!(
                    "EHCI: queue qTD {:#x} token {:#x} length {}",
                    physical,
                    value,
                    stage.length
                );
            }
        }

        self.swap_placeholder(endpoint_handle, handle, ids[0], dummy, queue_head);
        Ok(())
    }

    /// Move the first descriptor of a freshly programmed set into the queue's
    /// placeholder and activate it
    fn swap_placeholder(
        &mut self,
        endpoint: EndpointHandle,
        set: TransferHandle,
        first: TransferId,
        dummy: TransferId,
        head: QhHandle,
    ) {
        let first_record = self.transfers[first.index()];
        let dummy_record = self.transfers[dummy.index()];
        let first_descriptor = self.pool.transfer_descriptor(first_record.descriptor);
        let dummy_descriptor = self.pool.transfer_descriptor(dummy_record.descriptor);

        let active_token = first_descriptor.token();
        dummy_descriptor.copy_links_and_buffers(first_descriptor);

        replace_id(&mut self.endpoints[endpoint.index()].transfers, first, dummy);
        replace_id(&mut self.in_flight, first, dummy);

        first_descriptor.init_placeholder();

        self.transfers[dummy.index()] = Transfer {
            length: first_record.length,
            last: first_record.last,
            set: Some(set),
            queued: true,
            ..dummy_record
        };
        self.transfers[first.index()] = Transfer {
            length: 0,
            last: false,
            set: None,
            queued: false,
            ..first_record
        };
        self.sets[set.index()].transfers[0] = dummy;
        if let Some(queue) = self.queue_mut(endpoint) {
            queue.dummy = first;
        }

        write_ordered(&dummy_descriptor.token, active_token);

        // A halted overlay does not advance on its own; point it at the new
        // work unless it is parked on the new placeholder
        let queue_head = self.pool.queue_head(head);
        if queue_head.overlay_token() & token::STATUS_HALTED != 0
            && queue_head.current_qtd.load(Ordering::Relaxed) != first_record.physical
        {
            queue_head.current_qtd.store(0, Ordering::Relaxed);
            queue_head.next_qtd.store(dummy_record.physical, Ordering::Relaxed);
            write_ordered(&queue_head.token, queue_head.overlay_token() & token::DATA_TOGGLE);
        }
    }

    // Completion processing

    /// Retire one descriptor if the controller is done with it
    ///
    /// Returns `true` when its set should leave the schedule.
    fn process_transfer(&mut self, id: TransferId) -> bool {
        let Some(&record) = self.transfers.get(id.index()) else {
            return false;
        };
        let Some(set_handle) = record.set.filter(|_| record.queued) else {
            return false;
        };

        let hardware_token = self.pool.transfer_descriptor(record.descriptor).token();
        if hardware_token & token::STATUS_ACTIVE != 0 {
            return false;
        }

        self.dequeue(id);

        let transferred = record
            .length
            .saturating_sub(token::bytes_remaining(hardware_token));
        let short = transferred != record.length;

        let set = &mut self.sets[set_handle.index()];
        set.length_transferred += transferred;
        let control = set.transfer_type == TransferType::Control;
        let mut remove = record.last || (short && !control);

        if hardware_token & token::STATUS_ERROR_MASK != 0 {
            remove = true;
            set.status = Err(UsbError::DeviceIoError);
            set.error = token_error(hardware_token);

            #[cfg(feature = "defmt")]
            if self.debug.contains(DebugFlags::ERRORS) {
                defmt::warn!(
                    "EHCI: qTD {:#x} failed, token {:#x}",
                    record.physical,
                    hardware_token
                );
            }

            // Clear the halt so the queue can run again once drained
            if hardware_token & token::STATUS_HALTED != 0 {
                if let Some(queue) = self
                    .endpoints
                    .get(set.endpoint.index())
                    .and_then(|endpoint| endpoint.queue.as_ref())
                {
                    write_ordered(&self.pool.queue_head(queue.head).current_qtd, 0);
                }
            }
        } else if short && set.request_flags().contains(TransferFlags::NO_SHORT_TRANSFERS) {
            set.status = Err(UsbError::DataLengthMismatch);
            set.error = TransferError::ShortPacket;
        }

        #[cfg(feature = "defmt")]
        if self.debug.contains(DebugFlags::TRANSFERS) {
            defmt::debug!(
                "EHCI: retired qTD {:#x}, {} of {} bytes",
                record.physical,
                transferred,
                record.length
            );
        }

        remove
    }

    /// Unhook a record from the endpoint and in-flight lists
    fn dequeue(&mut self, id: TransferId) {
        let record = &mut self.transfers[id.index()];
        record.queued = false;

        if let Some(set) = record.set {
            let endpoint = self.sets[set.index()].endpoint;
            if let Some(endpoint) = self.endpoints.get_mut(endpoint.index()) {
                remove_id(&mut endpoint.transfers, id);
            }
        }
        remove_id(&mut self.in_flight, id);
    }

    /// Drop the remaining descriptors of a finished set
    ///
    /// The controller stopped at or before them, so no hardware fix-up is
    /// needed.
    fn remove_completed_set(&mut self, handle: TransferHandle) {
        let ids: Vec<TransferId, MAX_DESCRIPTORS_PER_SET> =
            self.sets[handle.index()].active_transfers().iter().copied().collect();

        for &id in ids.iter().rev() {
            if self.transfers[id.index()].queued {
                self.dequeue(id);
            }
        }

        self.sets[handle.index()]
            .flags
            .remove(SetFlags::QUEUED | SetFlags::CANCELLING);
    }

    /// Splice a set out of a queue the controller is not walking
    ///
    /// Earlier descriptors and the overlay that lead into the set are
    /// redirected to whatever follows it.
    fn remove_cancelled_set(&mut self, handle: TransferHandle) {
        let set = &self.sets[handle.index()];
        let endpoint_handle = set.endpoint;
        let set_physical: Vec<u32, MAX_DESCRIPTORS_PER_SET> = set
            .active_transfers()
            .iter()
            .map(|id| self.transfers[id.index()].physical)
            .collect();
        let ids: Vec<TransferId, MAX_DESCRIPTORS_PER_SET> =
            set.active_transfers().iter().copied().collect();

        if let Some(endpoint) = self.endpoints.get(endpoint_handle.index()) {
            if let Some(queue) = endpoint.queue.as_ref() {
                let belongs = |id: &TransferId| self.transfers[id.index()].set == Some(handle);
                let list = &endpoint.transfers;

                if let Some(start) = list.iter().position(belongs) {
                    let end = start + list[start..].iter().take_while(|id| belongs(*id)).count();
                    let next_physical = match list.get(end) {
                        Some(id) => self.transfers[id.index()].physical,
                        None => self.transfers[queue.dummy.index()].physical,
                    };

                    for id in &list[..start] {
                        let descriptor =
                            self.pool.transfer_descriptor(self.transfers[id.index()].descriptor);
                        redirect(&descriptor.next_qtd, &set_physical, next_physical);
                        redirect(&descriptor.alt_next_qtd, &set_physical, next_physical);
                    }

                    let head = self.pool.queue_head(queue.head);
                    let in_set = |pointer: u32| {
                        set_physical.contains(&(pointer & link::ADDRESS_MASK))
                    };

                    if start == 0
                        || in_set(head.current_qtd.load(Ordering::Relaxed))
                        || in_set(head.next_qtd.load(Ordering::Relaxed))
                    {
                        head.current_qtd.store(0, Ordering::Relaxed);
                        head.next_qtd.store(next_physical, Ordering::Relaxed);
                        head.alt_next_qtd.store(next_physical, Ordering::Relaxed);
                        write_ordered(&head.token, head.overlay_token() & token::DATA_TOGGLE);
                    } else {
                        redirect(&head.alt_next_qtd, &set_physical, next_physical);
                    }
                }
            }
        }

        for &id in ids.iter().rev() {
            if self.transfers[id.index()].queued {
                self.dequeue(id);
            }
        }

        self.sets[handle.index()]
            .flags
            .remove(SetFlags::QUEUED | SetFlags::CANCELLING);
    }

    /// Finish every cancelling set of an endpoint whose queue is out of the
    /// hardware walk
    ///
    /// A set the controller completed before it let go is reported normally.
    fn retire_cancelling_sets(&mut self, endpoint: EndpointHandle, completions: &mut Completions) {
        let cancelling: Vec<TransferHandle, MAX_TRANSFER_SETS> = self
            .sets
            .iter()
            .filter(|(_, set)| {
                set.endpoint == endpoint && set.flags.contains(SetFlags::QUEUED | SetFlags::CANCELLING)
            })
            .map(|(index, _)| TransferHandle(index as u16))
            .collect();

        for handle in cancelling {
            let ids: Vec<TransferId, MAX_DESCRIPTORS_PER_SET> =
                self.sets[handle.index()].active_transfers().iter().copied().collect();

            let finished = ids.iter().any(|&id| self.process_transfer(id));
            if finished {
                self.remove_completed_set(handle);
            } else {
                let set = &mut self.sets[handle.index()];
                set.status = Err(UsbError::Cancelled);
                set.error = TransferError::Cancelled;
                self.remove_cancelled_set(handle);
            }

            let _ = completions.push(self.sets[handle.index()].completion(handle));
        }
    }

    /// Retire every finished descriptor on the in-flight list
    pub fn reap(&mut self, completions: &mut Completions) {
        let snapshot = self.in_flight.clone();
        for id in snapshot {
            if !self.transfers.get(id.index()).is_some_and(|record| record.queued) {
                continue;
            }

            if self.process_transfer(id) {
                if let Some(set) = self.transfers[id.index()].set {
                    self.remove_completed_set(set);
                    let _ = completions.push(self.sets[set.index()].completion(set));
                }
            }
        }
    }

    /// Handle the async advance interrupt
    ///
    /// Queues released by this doorbell either have their cancelled sets
    /// retired and go back on the ring, or are handed to destroy work.
    /// Returns `true` when destroy work has to be scheduled.
    pub fn async_advance(&mut self, completions: &mut Completions) -> bool {
        let (released, ring) = self.doorbell.advance();
        if ring {
            self.ring_doorbell();
        }

        let mut schedule_destroy = false;
        for handle in released {
            let Some(endpoint) = self.endpoints.get_mut(handle.index()) else {
                continue;
            };
            let destroying = endpoint.destroying;
            let Some(queue) = endpoint.queue.as_mut() else {
                continue;
            };

            if core::mem::take(&mut queue.cancel_pending) {
                self.retire_cancelling_sets(handle, completions);
            }

            if destroying {
                if let Some(queue) = self.queue_mut(handle) {
                    queue.state = QueueState::Removed;
                }
                if self.destroy_list.is_empty() {
                    schedule_destroy = true;
                }
                let _ = self.destroy_list.push(handle);
            } else {
                self.link(handle);
            }
        }

        schedule_destroy
    }

    // Cancellation

    /// Start pulling a queued set out of the schedule
    pub fn begin_cancel(&mut self, handle: TransferHandle) -> Result<CancelStep> {
        let set = self
            .sets
            .get_mut(handle.index())
            .ok_or(UsbError::InvalidParameter)?;
        if !set.is_queued() {
            return Err(UsbError::TooLate);
        }

        let endpoint = set.endpoint;
        let Some(queue) = self
            .endpoints
            .get(endpoint.index())
            .and_then(|owner| owner.queue.as_ref())
        else {
            return Err(UsbError::NotImplemented);
        };

        if set.flags.contains(SetFlags::CANCELLING) {
            return Ok(CancelStep::Pending);
        }
        set.flags.insert(SetFlags::CANCELLING);

        let (placement, state, cancel_pending) = (queue.placement, queue.state, queue.cancel_pending);
        match placement {
            Placement::Periodic { .. } => {
                if state != QueueState::Linked {
                    return Ok(CancelStep::Pending);
                }

                self.unlink(endpoint);
                if let Some(queue) = self.queue_mut(endpoint) {
                    queue.state = QueueState::Unlinked;
                }
                Ok(CancelStep::WaitFrame(endpoint))
            }
            Placement::Asynchronous => {
                if cancel_pending {
                    return Ok(CancelStep::Pending);
                }

                if let Some(queue) = self.queue_mut(endpoint) {
                    queue.cancel_pending = true;
                }
                if state == QueueState::Linked {
                    self.unlink(endpoint);
                    self.stage(endpoint);
                }
                Ok(CancelStep::Pending)
            }
        }
    }

    /// Finish a periodic cancel once a frame has passed
    ///
    /// Returns `TooLate` when the set completed before it could be pulled.
    pub fn finish_periodic_cancel(
        &mut self,
        endpoint: EndpointHandle,
        transfer: TransferHandle,
        completions: &mut Completions,
    ) -> Result<()> {
        let Some(owner) = self.endpoints.get(endpoint.index()) else {
            return Err(UsbError::TooLate);
        };
        let relink = !owner.destroying
            && matches!(&owner.queue, Some(queue) if queue.state == QueueState::Unlinked);

        self.retire_cancelling_sets(endpoint, completions);
        if relink {
            self.link(endpoint);
        }

        match self.sets.get(transfer.index()) {
            Some(set) if set.error == TransferError::Cancelled => Ok(()),
            _ => Err(UsbError::TooLate),
        }
    }

    // Polled operation

    /// One pass over an endpoint: retire finished sets without callbacks
    ///
    /// Returns the number of sets retired and whether the endpoint is idle.
    pub fn flush_pass(&mut self, endpoint: EndpointHandle) -> Result<(u32, bool)> {
        let owner = self
            .endpoints
            .get(endpoint.index())
            .ok_or(UsbError::InvalidParameter)?;
        if owner.queue.is_none() {
            return Err(UsbError::NotSupported);
        }

        let snapshot = owner.transfers.clone();
        let mut retired = 0;
        for id in snapshot {
            if !self.transfers[id.index()].queued {
                continue;
            }

            if self.process_transfer(id) {
                if let Some(set) = self.transfers[id.index()].set {
                    self.remove_completed_set(set);
                    retired += 1;
                }
            }
        }

        Ok((retired, self.endpoints[endpoint.index()].transfers.is_empty()))
    }

    /// Submit a set that will be driven by [`Schedule::poll_set`]
    pub fn submit_polled(
        &mut self,
        handle: TransferHandle,
        request: &TransferRequest,
    ) -> Result<()> {
        let set = self.sets.get(handle.index()).ok_or(UsbError::InvalidParameter)?;
        let endpoint = self
            .endpoints
            .get(set.endpoint.index())
            .ok_or(UsbError::InvalidParameter)?;
        if !endpoint.transfers.is_empty() {
            return Err(UsbError::InvalidState);
        }

        self.submit(handle, request)
    }

    /// Retire whatever the controller finished of a polled set
    pub fn poll_set(&mut self, handle: TransferHandle) -> PollState {
        let Some(set) = self.sets.get(handle.index()) else {
            return PollState::Finished(Err(UsbError::InvalidParameter));
        };
        if !set.is_queued() {
            return PollState::Finished(set.status.map(|()| set.length_transferred));
        }

        let ids: Vec<TransferId, MAX_DESCRIPTORS_PER_SET> =
            set.active_transfers().iter().copied().collect();
        let mut progressed = false;

        for id in ids {
            if !self.transfers[id.index()].queued {
                continue;
            }

            let remove = self.process_transfer(id);
            if !self.transfers[id.index()].queued {
                progressed = true;
            }

            if remove {
                self.remove_completed_set(handle);
                let set = &self.sets[handle.index()];
                return PollState::Finished(set.status.map(|()| set.length_transferred));
            }
        }

        PollState::Running { progressed }
    }
}

impl<A: DescriptorAllocator + 'static> Drop for Schedule<A> {
    fn drop(&mut self) {
        for &anchor in &self.anchors {
            self.pool.free_queue_head(anchor);
        }
        self.pool.free_queue_head(self.async_head);
    }
}

fn replace_id(list: &mut [TransferId], old: TransferId, new: TransferId) {
    if let Some(slot) = list.iter_mut().find(|id| **id == old) {
        *slot = new;
    }
}

fn remove_id<const N: usize>(list: &mut Vec<TransferId, N>, id: TransferId) {
    if let Some(position) = list.iter().position(|queued| *queued == id) {
        list.remove(position);
    }
}

/// Point a link at `replacement` if it targets one of `targets`
fn redirect(pointer: &AtomicU32, targets: &[u32], replacement: u32) {
    let current = pointer.load(Ordering::Relaxed);
    if targets.contains(&(current & link::ADDRESS_MASK)) {
        write_ordered(pointer, replacement);
    }
}
