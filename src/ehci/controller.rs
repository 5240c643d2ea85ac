//! EHCI host controller driver
//!
//! [`EhciController`] ties the register block, the frame list and the
//! software [`Schedule`] together. The schedule lives behind a
//! `critical_section::Mutex` so the deferred interrupt handler and callers
//! on other contexts see it consistently. Waiting (reset handshake, frame
//! boundaries, polled transfers) always happens with the lock released, and
//! completion callbacks run only after it has been dropped.

use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

use super::config::EhciConfig;
use super::handoff::DebugHandoff;
use super::interrupt::PendingStatus;
use super::periodic::PeriodicFrameList;
use super::root_hub::{self, RootHubStatus};
use super::schedule::{CancelStep, Completions, DestroyStep, PollState, Schedule, ScheduleStats};
use super::timeouts::FRAME_TIME_US;
use super::{OperationalRegisters, PortSc, RegisterTimeout, UsbCmd, UsbIntr, UsbSts};
use crate::dma::DescriptorAllocator;
use crate::error::{Result, UsbError};
use crate::host::{HostCallbacks, HostController};
use crate::transfer::{
    EndpointHandle, EndpointRequest, TransferFlags, TransferHandle, TransferRequest,
};

/// EHCI host controller
pub struct EhciController<A: DescriptorAllocator + 'static, C: HostCallbacks> {
    regs: &'static OperationalRegisters,
    frame_list: &'static PeriodicFrameList,
    schedule: Mutex<RefCell<Schedule<A>>>,
    pending: PendingStatus,
    callbacks: C,
    config: EhciConfig,
    debugger_disconnect: Option<fn()>,
}

impl<A: DescriptorAllocator + 'static, C: HostCallbacks> EhciController<A, C> {
    /// Build the schedule structures for a controller
    ///
    /// The hardware is not touched beyond the frame list until
    /// [`reset_controller`](Self::reset_controller) runs. With a debugger
    /// hand-off the asynchronous list head is spliced into the debugger's
    /// ring instead of forming a ring of its own.
    pub fn new(
        regs: &'static OperationalRegisters,
        pool: &'static A,
        frame_list: &'static PeriodicFrameList,
        callbacks: C,
        config: EhciConfig,
        handoff: Option<&mut DebugHandoff>,
    ) -> Result<Self> {
        config.validate()?;

        let debugger_disconnect = handoff.as_ref().and_then(|handoff| handoff.disconnect);
        let schedule = Schedule::new(pool, regs, frame_list, handoff, config.debug)?;

        Ok(Self {
            regs,
            frame_list,
            schedule: Mutex::new(RefCell::new(schedule)),
            pending: PendingStatus::new(),
            callbacks,
            config,
            debugger_disconnect,
        })
    }

    fn with_schedule<R>(&self, f: impl FnOnce(&mut Schedule<A>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.schedule.borrow_ref_mut(cs)))
    }

    fn deliver(&self, completions: Completions) {
        for completion in completions {
            self.callbacks.transfer_completed(completion);
        }
    }

    /// Reset the controller and start both schedules
    pub fn reset_controller<D: DelayNs>(&self, delay: &mut D) -> Result<()> {
        let regs = self.regs;

        regs.usbcmd.write(UsbCmd::HC_RESET.bits());
        RegisterTimeout::new_ms(self.config.reset_timeout_ms)
            .wait_for(delay, || (regs.usbcmd.read() & UsbCmd::HC_RESET.bits()) == 0)
            .inspect_err(|_| {
                #[cfg(feature = "defmt")]
                defmt::error!("EHCI: host controller reset did not complete");
            })?;

        regs.usbsts.write(0);
        regs.ctrldssegment.write(0);
        regs.usbintr.write(
            (UsbIntr::INTERRUPT_ON_ASYNC_ADVANCE_ENABLE
                | UsbIntr::HOST_SYSTEM_ERROR_ENABLE
                | UsbIntr::PORT_CHANGE_INTERRUPT_ENABLE
                | UsbIntr::USB_ERROR_INTERRUPT_ENABLE
                | UsbIntr::USB_INTERRUPT_ENABLE)
                .bits(),
        );

        regs.periodiclistbase.write(self.frame_list.base_address());
        regs.asynclistaddr
            .write(self.with_schedule(|schedule| schedule.async_head_physical()));

        let command = self.config.run_command();
        regs.usbcmd.write(command.bits());
        self.with_schedule(|schedule| schedule.set_command(command));

        // Route every port to this controller
        regs.configflag.write(1);

        for port in &regs.portsc[..self.config.port_count as usize] {
            let value = PortSc::from_bits_retain(port.read());
            if !value.contains(PortSc::PORT_POWER) {
                port.write(
                    value
                        .difference(PortSc::CHANGE_BITS)
                        .union(PortSc::PORT_POWER)
                        .bits(),
                );
            }
        }

        #[cfg(feature = "defmt")]
        defmt::info!(
            "EHCI: controller running, command {:#x}, {} ports",
            command.bits(),
            self.config.port_count
        );

        Ok(())
    }

    /// Interrupt service routine
    ///
    /// Claims and acknowledges the status bits for [`interrupt_dispatch`].
    /// Returns `false` when the interrupt was not raised by this controller.
    ///
    /// [`interrupt_dispatch`]: Self::interrupt_dispatch
    pub fn interrupt_service(&self) -> bool {
        let status = UsbSts::from_bits_retain(self.regs.usbsts.read())
            .intersection(UsbSts::INTERRUPT_MASK);
        if status.is_empty() {
            return false;
        }

        self.pending.accumulate(status);
        self.regs.usbsts.write_1_to_clear(status.bits());
        true
    }

    /// Deferred interrupt handler
    ///
    /// Reaps finished transfers and services the async advance doorbell,
    /// then runs the callbacks. Returns `false` if nothing was pending.
    pub fn interrupt_dispatch(&self) -> bool {
        let status = self.pending.take();
        if status.is_empty() {
            return false;
        }

        if status.contains(UsbSts::HOST_SYSTEM_ERROR) {
            #[cfg(feature = "defmt")]
            defmt::error!("EHCI: host system error, status {:#x}", status.bits());
        }

        if status.contains(UsbSts::PORT_CHANGE_DETECT) {
            self.callbacks.port_changed();
        }

        let mut completions = Completions::new();
        let schedule_destroy = self.with_schedule(|schedule| {
            schedule.reap(&mut completions);

            status.contains(UsbSts::INTERRUPT_ON_ASYNC_ADVANCE)
                && schedule.async_advance(&mut completions)
        });

        self.deliver(completions);
        if schedule_destroy {
            self.callbacks.schedule_destroy_work();
        }

        true
    }

    /// Destroy work: free every endpoint the async advance handler queued
    pub fn destroy_queued_endpoints(&self) -> usize {
        let released = self.with_schedule(|schedule| schedule.destroy_queued_endpoints());

        #[cfg(feature = "defmt")]
        if released != 0 {
            defmt::debug!("EHCI: released {} endpoints", released);
        }

        released
    }

    /// Schedule occupancy
    pub fn stats(&self) -> ScheduleStats {
        self.with_schedule(|schedule| schedule.stats())
    }

    /// Configuration the controller was built with
    pub fn config(&self) -> &EhciConfig {
        &self.config
    }

    /// Callbacks the controller reports to
    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }
}

impl<A: DescriptorAllocator + 'static, C: HostCallbacks> HostController for EhciController<A, C> {
    fn create_endpoint(&self, request: &EndpointRequest) -> Result<EndpointHandle> {
        self.with_schedule(|schedule| schedule.create_endpoint(request))
    }

    fn reset_endpoint(&self, endpoint: EndpointHandle, max_packet_size: u16) -> Result<()> {
        self.with_schedule(|schedule| schedule.reset_endpoint(endpoint, max_packet_size))
    }

    fn flush_endpoint<D: DelayNs>(&self, endpoint: EndpointHandle, delay: &mut D) -> Result<u32> {
        let timeout = RegisterTimeout::new_ms(self.config.flush_timeout_ms);
        let mut elapsed = timeout.start();
        let mut flushed = 0;

        loop {
            let (retired, idle) = self.with_schedule(|schedule| schedule.flush_pass(endpoint))?;
            flushed += retired;
            if idle {
                return Ok(flushed);
            }

            if !timeout.tick(delay, &mut elapsed) {
                #[cfg(feature = "defmt")]
                defmt::warn!("EHCI: flush timed out after {} sets", flushed);
                return Err(UsbError::Timeout);
            }
        }
    }

    fn destroy_endpoint<D: DelayNs>(&self, endpoint: EndpointHandle, delay: &mut D) -> Result<()> {
        match self.with_schedule(|schedule| schedule.begin_destroy(endpoint))? {
            DestroyStep::WaitFrame => {
                delay.delay_us(FRAME_TIME_US);
                self.with_schedule(|schedule| schedule.release_endpoint(endpoint));
            }
            DestroyStep::Done | DestroyStep::Deferred => {}
        }

        Ok(())
    }

    fn create_transfer(
        &self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle> {
        self.with_schedule(|schedule| schedule.create_transfer(endpoint, max_buffer_size, flags))
    }

    fn destroy_transfer(&self, transfer: TransferHandle) -> Result<()> {
        self.with_schedule(|schedule| schedule.destroy_transfer(transfer))
    }

    fn submit_transfer(&self, transfer: TransferHandle, request: &TransferRequest) -> Result<()> {
        self.with_schedule(|schedule| schedule.submit(transfer, request))
    }

    fn submit_polled_transfer<D: DelayNs>(
        &self,
        transfer: TransferHandle,
        request: &TransferRequest,
        delay: &mut D,
    ) -> Result<u32> {
        self.with_schedule(|schedule| schedule.submit_polled(transfer, request))?;

        // The budget applies per descriptor, so progress restarts it
        let timeout = RegisterTimeout::new_ms(self.config.polled_timeout_ms);
        let mut elapsed = timeout.start();

        loop {
            match self.with_schedule(|schedule| schedule.poll_set(transfer)) {
                PollState::Finished(result) => return result,
                PollState::Running { progressed } => {
                    if progressed {
                        elapsed = timeout.start();
                    }

                    if !timeout.tick(delay, &mut elapsed) {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("EHCI: polled transfer {} timed out", transfer);
                        return Err(UsbError::Timeout);
                    }
                }
            }
        }
    }

    fn cancel_transfer<D: DelayNs>(&self, transfer: TransferHandle, delay: &mut D) -> Result<()> {
        match self.with_schedule(|schedule| schedule.begin_cancel(transfer))? {
            CancelStep::Pending => Ok(()),
            CancelStep::WaitFrame(endpoint) => {
                delay.delay_us(FRAME_TIME_US);

                let mut completions = Completions::new();
                let result = self.with_schedule(|schedule| {
                    schedule.finish_periodic_cancel(endpoint, transfer, &mut completions)
                });
                self.deliver(completions);

                result
            }
        }
    }

    fn get_root_hub_status(&self, status: &mut RootHubStatus) -> Result<()> {
        root_hub::get_status(
            self.regs,
            status,
            self.config.port_count as usize,
            self.config.debug,
        );
        Ok(())
    }

    fn set_root_hub_status<D: DelayNs>(
        &self,
        status: &mut RootHubStatus,
        delay: &mut D,
    ) -> Result<()> {
        root_hub::set_status(self.regs, status, self.config.port_count as usize, delay);
        Ok(())
    }
}

impl<A: DescriptorAllocator + 'static, C: HostCallbacks> Drop for EhciController<A, C> {
    fn drop(&mut self) {
        if let Some(disconnect) = self.debugger_disconnect {
            disconnect();
        }

        self.regs.usbcmd.clear_bits(
            (UsbCmd::PERIODIC_SCHEDULE_ENABLE | UsbCmd::ASYNC_SCHEDULE_ENABLE).bits(),
        );
        self.frame_list.clear();
    }
}
