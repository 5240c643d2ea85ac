//! Error handling tests
//!
//! Tests verify parameter checking, hardware error classification and the
//! rollback of partial allocations without requiring actual hardware.

mod common;

use common::{
    advance_queue, async_ring, complete_all, complete_descriptor, fire_interrupt, queue_chain,
    test_bed, MockDelay, Recorder,
};
use ehci_hcd::dma::{DescriptorAllocator, DescriptorPool};
use ehci_hcd::ehci::{token, EhciConfig, EhciController, UsbSts};
use ehci_hcd::{
    DeviceSpeed, Direction, EndpointRequest, HostController, OperationalRegisters,
    PeriodicFrameList, TransferError, TransferFlags, TransferRequest, TransferType, UsbError,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_in() -> EndpointRequest {
        EndpointRequest::bulk(DeviceSpeed::High, 1, Direction::In, 512)
    }

    /// Run one bulk IN transfer to a token carrying `status` and return
    /// what the completion reported
    fn fail_with(status: u32) -> (Result<(), UsbError>, TransferError) {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        let queue_head = async_ring(bed.pool, bed.async_head())[0];
        let transfer = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();
        controller
            .submit_transfer(transfer, &TransferRequest::new(1, Direction::In, 0x2000_0000, 512))
            .unwrap();

        let chain = queue_chain(bed.pool, queue_head);
        complete_descriptor(bed.pool, chain[0], 512, status);
        fire_interrupt(&bed, UsbSts::USB_ERROR_INTERRUPT);

        let completions = bed.recorder().completions_for(transfer);
        assert_eq!(completions.len(), 1);
        (completions[0].status, completions[0].error)
    }

    /// Malformed endpoint descriptions are refused
    #[test]
    fn test_invalid_endpoint_parameters() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let mut request = bulk_in();
        request.endpoint_number = 16;
        assert_eq!(controller.create_endpoint(&request), Err(UsbError::InvalidParameter));

        let mut request = bulk_in();
        request.max_packet_size = 2048;
        assert_eq!(controller.create_endpoint(&request), Err(UsbError::InvalidParameter));

        assert_eq!(controller.stats().endpoints, 0);
    }

    /// Control transfers must at least carry the setup packet
    #[test]
    fn test_control_transfer_needs_setup_packet() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller
            .create_endpoint(&EndpointRequest::control(DeviceSpeed::Full, 0, 8))
            .unwrap();
        assert_eq!(
            controller.create_transfer(endpoint, 4, TransferFlags::empty()),
            Err(UsbError::InvalidParameter)
        );

        let transfer = controller
            .create_transfer(endpoint, 64, TransferFlags::empty())
            .unwrap();
        assert_eq!(
            controller.submit_transfer(transfer, &TransferRequest::new(0, Direction::In, 0x2000_0000, 6)),
            Err(UsbError::InvalidParameter)
        );
    }

    /// Requests are bounded by the size the transfer was created for, and a
    /// queued transfer cannot be submitted or destroyed
    #[test]
    fn test_submission_rules() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        let transfer = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();

        let too_long = TransferRequest::new(1, Direction::In, 0x2000_0000, 513);
        assert_eq!(controller.submit_transfer(transfer, &too_long), Err(UsbError::InvalidParameter));

        let request = TransferRequest::new(1, Direction::In, 0x2000_0000, 512);
        controller.submit_transfer(transfer, &request).unwrap();
        assert_eq!(controller.submit_transfer(transfer, &request), Err(UsbError::InvalidState));
        assert_eq!(controller.destroy_transfer(transfer), Err(UsbError::InvalidState));

        complete_all(bed.pool);
        fire_interrupt(&bed, UsbSts::USB_INTERRUPT);
        controller.destroy_transfer(transfer).unwrap();
        assert_eq!(controller.destroy_transfer(transfer), Err(UsbError::InvalidParameter));
    }

    /// Isochronous endpoints exist but carry no transfers
    #[test]
    fn test_isochronous_is_not_implemented() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let request = EndpointRequest {
            transfer_type: TransferType::Isochronous,
            ..EndpointRequest::interrupt(DeviceSpeed::High, 3, Direction::In, 1024, 1)
        };
        let endpoint = controller.create_endpoint(&request).unwrap();
        assert_eq!(controller.stats().live_queue_heads, 0);

        let transfer = controller
            .create_transfer(endpoint, 1024, TransferFlags::empty())
            .unwrap();
        let submission = TransferRequest::new(1, Direction::In, 0x2000_0000, 1024);
        assert_eq!(
            controller.submit_transfer(transfer, &submission),
            Err(UsbError::NotImplemented)
        );
        assert_eq!(
            controller.flush_endpoint(endpoint, &mut MockDelay::new()),
            Err(UsbError::NotSupported)
        );
        assert_eq!(
            controller.cancel_transfer(transfer, &mut MockDelay::new()),
            Err(UsbError::TooLate)
        );

        controller.destroy_transfer(transfer).unwrap();
        controller.destroy_endpoint(endpoint, &mut MockDelay::new()).unwrap();
        assert_eq!(controller.stats().endpoints, 0);
    }

    /// Token error bits decode with halted taking priority
    #[test]
    fn test_hardware_error_classification() {
        assert_eq!(
            fail_with(token::STATUS_HALTED),
            (Err(UsbError::DeviceIoError), TransferError::Stalled)
        );
        assert_eq!(
            fail_with(token::STATUS_HALTED | token::STATUS_BABBLE),
            (Err(UsbError::DeviceIoError), TransferError::Stalled)
        );
        assert_eq!(
            fail_with(token::STATUS_MISSED_MICROFRAME | token::STATUS_TRANSACTION_ERROR),
            (Err(UsbError::DeviceIoError), TransferError::MissedMicroframe)
        );
        assert_eq!(
            fail_with(token::STATUS_TRANSACTION_ERROR),
            (Err(UsbError::DeviceIoError), TransferError::CrcOrTimeout)
        );
        assert_eq!(
            fail_with(token::STATUS_BABBLE | token::STATUS_DATA_BUFFER_ERROR),
            (Err(UsbError::DeviceIoError), TransferError::Babble)
        );
        assert_eq!(
            fail_with(token::STATUS_DATA_BUFFER_ERROR),
            (Err(UsbError::DeviceIoError), TransferError::DataBuffer)
        );
    }

    /// A stall clears the queue head's current descriptor so the queue can
    /// be restarted
    #[test]
    fn test_stall_resets_current_descriptor() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        let queue_head = async_ring(bed.pool, bed.async_head())[0];
        let transfer = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();
        controller
            .submit_transfer(transfer, &TransferRequest::new(1, Direction::In, 0x2000_0000, 512))
            .unwrap();

        let chain = queue_chain(bed.pool, queue_head);
        let head = bed.pool.queue_head(bed.pool.queue_head_at(queue_head).unwrap());
        head.current_qtd.store(chain[0], std::sync::atomic::Ordering::Relaxed);

        complete_descriptor(bed.pool, chain[0], 512, token::STATUS_HALTED);
        fire_interrupt(&bed, UsbSts::USB_ERROR_INTERRUPT);
        assert_eq!(head.current_qtd.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    /// Short reads are errors only when the transfer asked for full length
    #[test]
    fn test_short_transfer_policy() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        let queue_head = async_ring(bed.pool, bed.async_head())[0];
        let strict = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();
        let lenient = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();

        let request = TransferRequest::new(1, Direction::In, 0x2000_0000, 512);
        controller
            .submit_transfer(strict, &request.with_flags(TransferFlags::NO_SHORT_TRANSFERS))
            .unwrap();
        let chain = queue_chain(bed.pool, queue_head);
        complete_descriptor(bed.pool, chain[0], 500, 0);
        fire_interrupt(&bed, UsbSts::USB_INTERRUPT);

        let completion = bed.recorder().completions_for(strict)[0];
        assert_eq!(completion.status, Err(UsbError::DataLengthMismatch));
        assert_eq!(completion.error, TransferError::ShortPacket);
        assert_eq!(completion.length_transferred, 12);

        advance_queue(bed.pool, queue_head);
        controller.submit_transfer(lenient, &request).unwrap();
        let chain = queue_chain(bed.pool, queue_head);
        complete_descriptor(bed.pool, chain[0], 500, 0);
        fire_interrupt(&bed, UsbSts::USB_INTERRUPT);

        let completion = bed.recorder().completions_for(lenient)[0];
        assert_eq!(completion.status, Ok(()));
        assert_eq!(completion.error, TransferError::None);
        assert_eq!(completion.length_transferred, 12);
    }

    /// Transfers larger than a set can describe are refused up front
    #[test]
    fn test_oversized_transfer_is_refused() {
        let bed = test_bed(EhciConfig::default());
        let controller = &bed.controller;

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        let before = bed.pool.stats();
        assert_eq!(
            controller.create_transfer(endpoint, 1 << 20, TransferFlags::empty()),
            Err(UsbError::NoResources)
        );
        assert_eq!(bed.pool.stats(), before);
    }

    /// Running the pool dry part way through a transfer gives every
    /// descriptor back
    #[test]
    fn test_descriptor_exhaustion_rolls_back() {
        type SmallPool = DescriptorPool<16, 20>;

        let regs: &'static OperationalRegisters = Box::leak(Box::new(OperationalRegisters::new()));
        let pool: &'static SmallPool = Box::leak(Box::new(SmallPool::new()));
        let frame_list: &'static PeriodicFrameList = Box::leak(Box::new(PeriodicFrameList::new()));
        let controller = EhciController::new(
            regs,
            pool,
            frame_list,
            Recorder::default(),
            EhciConfig::default(),
            None,
        )
        .unwrap();

        let endpoint = controller.create_endpoint(&bulk_in()).unwrap();
        assert_eq!(pool.stats().qtd_in_use(), 1);

        // Sixteen descriptors each; the second one runs out after three
        let size = 15 * 20_480;
        let first = controller
            .create_transfer(endpoint, size, TransferFlags::empty())
            .unwrap();
        assert_eq!(pool.stats().qtd_in_use(), 17);
        assert_eq!(
            controller.create_transfer(endpoint, size, TransferFlags::empty()),
            Err(UsbError::NoResources)
        );
        assert_eq!(pool.stats().qtd_in_use(), 17);

        controller.destroy_transfer(first).unwrap();
        assert_eq!(pool.stats().qtd_in_use(), 1);
    }

    /// Queue head exhaustion during endpoint creation leaks nothing
    #[test]
    fn test_queue_head_exhaustion_rolls_back() {
        type SmallPool = DescriptorPool<11, 8>;

        let regs: &'static OperationalRegisters = Box::leak(Box::new(OperationalRegisters::new()));
        let pool: &'static SmallPool = Box::leak(Box::new(SmallPool::new()));
        let frame_list: &'static PeriodicFrameList = Box::leak(Box::new(PeriodicFrameList::new()));
        let controller = EhciController::new(
            regs,
            pool,
            frame_list,
            Recorder::default(),
            EhciConfig::default(),
            None,
        )
        .unwrap();

        controller.create_endpoint(&bulk_in()).unwrap();
        controller.create_endpoint(&bulk_in()).unwrap();
        let before = pool.stats();
        assert_eq!(controller.create_endpoint(&bulk_in()), Err(UsbError::NoResources));
        assert_eq!(pool.stats(), before);
        assert_eq!(controller.stats().endpoints, 2);
    }

    /// Construction fails cleanly when the pool cannot hold the schedule
    #[test]
    fn test_construction_needs_schedule_heads() {
        type TinyPool = DescriptorPool<4, 4>;

        let regs: &'static OperationalRegisters = Box::leak(Box::new(OperationalRegisters::new()));
        let pool: &'static TinyPool = Box::leak(Box::new(TinyPool::new()));
        let frame_list: &'static PeriodicFrameList = Box::leak(Box::new(PeriodicFrameList::new()));
        let result = EhciController::new(
            regs,
            pool,
            frame_list,
            Recorder::default(),
            EhciConfig::default(),
            None,
        );

        assert_eq!(result.err(), Some(UsbError::NoResources));
        assert_eq!(pool.stats().qh_in_use(), 0);
    }

    /// Configuration values the hardware cannot express are refused
    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            EhciConfig::builder().interrupt_threshold(3).build(),
            Err(UsbError::InvalidConfiguration)
        );
        assert_eq!(
            EhciConfig::builder().port_count(16).build(),
            Err(UsbError::InvalidConfiguration)
        );
        assert!(EhciConfig::builder().async_park_count(0).build().is_ok());
    }

    /// A controller that never finishes its reset reports a timeout
    #[test]
    fn test_reset_timeout() {
        let regs: &'static OperationalRegisters = Box::leak(Box::new(OperationalRegisters::new()));
        let pool: &'static common::Pool = Box::leak(Box::new(DescriptorPool::new()));
        let frame_list: &'static PeriodicFrameList = Box::leak(Box::new(PeriodicFrameList::new()));
        let config = EhciConfig::builder().reset_timeout_ms(2).build().unwrap();
        let controller =
            EhciController::new(regs, pool, frame_list, Recorder::default(), config, None).unwrap();

        let mut delay = MockDelay::new();
        assert_eq!(controller.reset_controller(&mut delay), Err(UsbError::Timeout));
        assert!(delay.elapsed_ns >= 2_000_000);
    }
}
