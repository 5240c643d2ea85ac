//! Mock hardware helpers for testing without a real controller
//!
//! The register block, descriptor pool and frame list live in leaked heap
//! memory so they satisfy the `'static` bounds of the driver. Nothing walks
//! the schedule on its own: tests play the controller by editing descriptor
//! tokens and raising status bits.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;

use ehci_hcd::dma::{DescriptorAllocator, DescriptorPool, QtdHandle};
use ehci_hcd::ehci::{
    link, token, EhciConfig, EhciController, OperationalRegisters, PeriodicFrameList, QueueTD,
    UsbCmd, UsbSts,
};
use ehci_hcd::{HostCallbacks, TransferCompletion, TransferHandle};
use embedded_hal::delay::DelayNs;

/// Queue heads in the test pool
pub const QUEUE_HEADS: usize = 48;
/// Transfer descriptors in the test pool
pub const TRANSFER_DESCRIPTORS: usize = 256;

/// Descriptor pool used by every test controller
pub type Pool = DescriptorPool<QUEUE_HEADS, TRANSFER_DESCRIPTORS>;
/// Controller under test
pub type Controller = EhciController<Pool, Recorder>;

/// Callbacks that remember everything they were told
#[derive(Default)]
pub struct Recorder {
    completions: RefCell<Vec<TransferCompletion>>,
    port_changes: Cell<u32>,
    destroy_work: Cell<u32>,
}

impl Recorder {
    /// Every completion delivered so far, oldest first
    pub fn completions(&self) -> Vec<TransferCompletion> {
        self.completions.borrow().clone()
    }

    /// Completions delivered for one transfer
    pub fn completions_for(&self, transfer: TransferHandle) -> Vec<TransferCompletion> {
        self.completions
            .borrow()
            .iter()
            .filter(|completion| completion.transfer == transfer)
            .copied()
            .collect()
    }

    /// Number of port change notifications
    pub fn port_changes(&self) -> u32 {
        self.port_changes.get()
    }

    /// Number of times destroy work was requested
    pub fn destroy_work(&self) -> u32 {
        self.destroy_work.get()
    }
}

impl HostCallbacks for Recorder {
    fn transfer_completed(&self, completion: TransferCompletion) {
        self.completions.borrow_mut().push(completion);
    }

    fn port_changed(&self) {
        self.port_changes.set(self.port_changes.get() + 1);
    }

    fn schedule_destroy_work(&self) {
        self.destroy_work.set(self.destroy_work.get() + 1);
    }
}

/// Delay that counts time and optionally plays hardware on every wait
pub struct MockDelay<'a> {
    /// Total time waited
    pub elapsed_ns: u64,
    hook: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a> MockDelay<'a> {
    /// Delay where nothing happens while waiting
    pub fn new() -> Self {
        Self {
            elapsed_ns: 0,
            hook: None,
        }
    }

    /// Delay that runs `hook` every time it is asked to wait
    pub fn with_hook(hook: impl FnMut() + 'a) -> Self {
        Self {
            elapsed_ns: 0,
            hook: Some(Box::new(hook)),
        }
    }
}

impl DelayNs for MockDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += ns as u64;
        if let Some(hook) = self.hook.as_mut() {
            hook();
        }
    }
}

/// Delay that finishes a host controller reset on the first wait
pub fn reset_delay(regs: &'static OperationalRegisters) -> MockDelay<'static> {
    MockDelay::with_hook(move || regs.usbcmd.clear_bits(UsbCmd::HC_RESET.bits()))
}

/// A running controller and the memory it drives
pub struct TestBed {
    /// Controller under test
    pub controller: Controller,
    /// Register block the controller writes
    pub regs: &'static OperationalRegisters,
    /// Descriptor memory
    pub pool: &'static Pool,
    /// Periodic frame list
    pub frame_list: &'static PeriodicFrameList,
}

impl TestBed {
    /// Callbacks of the controller
    pub fn recorder(&self) -> &Recorder {
        self.controller.callbacks()
    }

    /// Physical address of the asynchronous list head
    pub fn async_head(&self) -> u32 {
        self.regs.asynclistaddr.read()
    }
}

/// Build a controller on fresh memory and run the reset sequence
pub fn test_bed(config: EhciConfig) -> TestBed {
    let regs: &'static OperationalRegisters = Box::leak(Box::new(OperationalRegisters::new()));
    let pool: &'static Pool = Box::leak(Box::new(Pool::new()));
    let frame_list: &'static PeriodicFrameList = Box::leak(Box::new(PeriodicFrameList::new()));

    let controller = EhciController::new(regs, pool, frame_list, Recorder::default(), config, None)
        .expect("controller construction failed");
    controller
        .reset_controller(&mut reset_delay(regs))
        .expect("controller reset failed");

    TestBed {
        controller,
        regs,
        pool,
        frame_list,
    }
}

/// Descriptor at a physical address
pub fn descriptor(pool: &Pool, physical: u32) -> &QueueTD {
    let handle = pool
        .transfer_descriptor_at(physical)
        .expect("address is not a pool descriptor");
    pool.transfer_descriptor(handle)
}

/// Finish a descriptor the way the controller would: clear active, leave
/// `remaining` bytes untransferred and set `status` bits
pub fn complete_descriptor(pool: &Pool, physical: u32, remaining: u32, status: u32) {
    let descriptor = descriptor(pool, physical);
    let value = descriptor.token();
    let value = (value
        & !(token::STATUS_ACTIVE | (token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT)))
        | (remaining << token::TOTAL_BYTES_SHIFT)
        | status;
    descriptor.token.store(value, Ordering::Release);
}

/// Finish every active descriptor in the pool with all bytes moved
pub fn complete_all(pool: &Pool) -> usize {
    let mut finished = 0;
    for index in 0..TRANSFER_DESCRIPTORS {
        let handle = QtdHandle::new(index as u16);
        if pool.transfer_descriptor(handle).is_active() {
            complete_descriptor(pool, pool.transfer_descriptor_physical(handle), 0, 0);
            finished += 1;
        }
    }

    finished
}

/// Active descriptors a queue head leads to, in hardware order
///
/// Finished descriptors are stepped over the way the controller would have
/// advanced past them; the walk ends at a terminate link.
pub fn queue_chain(pool: &Pool, queue_head: u32) -> Vec<u32> {
    let head = pool.queue_head(pool.queue_head_at(queue_head).expect("not a pool queue head"));
    let mut next = head.next_qtd.load(Ordering::Acquire);
    let mut chain = Vec::new();

    for _ in 0..TRANSFER_DESCRIPTORS {
        let Some(handle) = pool.transfer_descriptor_at(next) else {
            break;
        };
        let descriptor = pool.transfer_descriptor(handle);
        if descriptor.is_active() {
            chain.push(next);
        }
        next = descriptor.next_qtd.load(Ordering::Acquire);
    }

    chain
}

/// Move a queue head's overlay past finished descriptors, as the controller
/// does while it executes a queue
///
/// The overlay stops on the first descriptor that is still active or that
/// ends the queue.
pub fn advance_queue(pool: &Pool, queue_head: u32) {
    let head = pool.queue_head(pool.queue_head_at(queue_head).expect("not a pool queue head"));
    let mut next = head.next_qtd.load(Ordering::Acquire);

    while let Some(handle) = pool.transfer_descriptor_at(next) {
        let descriptor = pool.transfer_descriptor(handle);
        let following = descriptor.next_qtd.load(Ordering::Acquire);
        if descriptor.is_active() || pool.transfer_descriptor_at(following).is_none() {
            break;
        }
        next = following;
    }

    head.next_qtd.store(next, Ordering::Release);
}

/// Queue heads on the asynchronous ring after the list head
pub fn async_ring(pool: &Pool, head: u32) -> Vec<u32> {
    let mut ring = Vec::new();
    let mut current = head;

    loop {
        let queue_head = pool.queue_head(pool.queue_head_at(current).expect("broken ring"));
        let next = queue_head.horizontal() & link::ADDRESS_MASK;
        if next == head {
            return ring;
        }

        assert!(ring.len() < QUEUE_HEADS, "asynchronous ring does not close");
        ring.push(next);
        current = next;
    }
}

/// Raise `status` in USBSTS and run both interrupt halves
pub fn fire_interrupt(bed: &TestBed, status: UsbSts) {
    bed.regs.usbsts.write(status.bits());
    assert!(bed.controller.interrupt_service());
    // RAM does not implement write-1-to-clear
    bed.regs.usbsts.write(0);
    assert!(bed.controller.interrupt_dispatch());
}
