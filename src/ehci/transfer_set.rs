//! Transfer sets and their decomposition into hardware descriptors
//!
//! A transfer set is what the USB core submits and cancels. It reserves a
//! fixed number of descriptors when it is created; each submission splits the
//! caller's buffer into stages (setup, data chunks, optional zero length
//! packet, status) and programs one descriptor per stage.

use core::sync::atomic::Ordering;

use bitflags::bitflags;
use heapless::Vec;

use super::limits::MAX_DESCRIPTORS_PER_SET;
use super::qtd::{token, QueueTD, MAX_DESCRIPTOR_TRANSFER};
use super::register::write_ordered;
use crate::dma::{page_offset, QtdHandle, PAGE_SIZE};
use crate::error::{Result, TransferError, UsbError};
use crate::transfer::{
    Direction, EndpointHandle, TransferCompletion, TransferFlags, TransferHandle, TransferRequest,
    TransferType, SETUP_PACKET_SIZE,
};

/// Index of a software transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(pub(crate) u16);

impl TransferId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Software record wrapping one hardware descriptor
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    /// Hardware descriptor
    pub descriptor: QtdHandle,
    /// Physical address of the descriptor
    pub physical: u32,
    /// Bytes this descriptor was programmed to move
    pub length: u32,
    /// Final descriptor of its set
    pub last: bool,
    /// Owning set, `None` while the record is an endpoint placeholder
    pub set: Option<TransferHandle>,
    /// Linked on the endpoint and in-flight lists
    pub queued: bool,
}

impl Transfer {
    /// Record for a freshly allocated descriptor
    pub const fn new(descriptor: QtdHandle, physical: u32, set: Option<TransferHandle>) -> Self {
        Self {
            descriptor,
            physical,
            length: 0,
            last: false,
            set,
            queued: false,
        }
    }
}

bitflags! {
    /// Transfer set state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetFlags: u8 {
        /// Descriptors are linked into the schedule
        const QUEUED = 1 << 0;
        /// A cancel is in progress
        const CANCELLING = 1 << 1;
    }
}

/// A logical transfer and the descriptors reserved for it
#[derive(Debug)]
pub struct TransferSet {
    /// Endpoint the set was created for
    pub endpoint: EndpointHandle,
    /// Transfer type of that endpoint
    pub transfer_type: TransferType,
    /// Largest buffer a submission may use
    pub max_buffer_size: u32,
    /// Reserved descriptors; the first `count` are used by the current submission
    pub transfers: Vec<TransferId, MAX_DESCRIPTORS_PER_SET>,
    /// Descriptors used by the current submission
    pub count: usize,
    /// State bits
    pub flags: SetFlags,
    /// Current submission
    pub request: Option<TransferRequest>,
    /// Bytes moved so far
    pub length_transferred: u32,
    /// Outcome
    pub status: Result<()>,
    /// Outcome detail
    pub error: TransferError,
}

impl TransferSet {
    /// Empty set; descriptors are attached by the caller
    pub fn new(
        endpoint: EndpointHandle,
        transfer_type: TransferType,
        max_buffer_size: u32,
    ) -> Self {
        Self {
            endpoint,
            transfer_type,
            max_buffer_size,
            transfers: Vec::new(),
            count: 0,
            flags: SetFlags::empty(),
            request: None,
            length_transferred: 0,
            status: Ok(()),
            error: TransferError::None,
        }
    }

    /// Check if the set is linked into the schedule
    pub fn is_queued(&self) -> bool {
        self.flags.contains(SetFlags::QUEUED)
    }

    /// Clear the previous outcome and record a new submission
    pub fn begin(&mut self, request: TransferRequest, count: usize) {
        self.flags = SetFlags::QUEUED;
        self.request = Some(request);
        self.count = count;
        self.length_transferred = 0;
        self.status = Ok(());
        self.error = TransferError::None;
    }

    /// Descriptors used by the current submission
    pub fn active_transfers(&self) -> &[TransferId] {
        &self.transfers[..self.count]
    }

    /// Flags of the current submission
    pub fn request_flags(&self) -> TransferFlags {
        self.request.map(|request| request.flags).unwrap_or_default()
    }

    /// Report for the USB core
    pub fn completion(&self, handle: TransferHandle) -> TransferCompletion {
        TransferCompletion {
            transfer: handle,
            status: self.status,
            error: self.error,
            length_transferred: self.length_transferred,
        }
    }
}

/// Worst-case descriptor count for buffers of up to `max_buffer_size` bytes
///
/// Any page offset is assumed, plus a zero length packet when one could be
/// forced.
pub fn reserved_descriptor_count(
    transfer_type: TransferType,
    max_buffer_size: u32,
    max_packet_size: u16,
    flags: TransferFlags,
) -> Result<usize> {
    let control = transfer_type == TransferType::Control;
    let force_short = flags.contains(TransferFlags::FORCE_SHORT_TRANSFER);
    let mut size = max_buffer_size;
    let mut count = 0;

    if control {
        size = size
            .checked_sub(SETUP_PACKET_SIZE)
            .ok_or(UsbError::InvalidParameter)?;
        count += 2;
    }

    if size != 0 {
        let padded = size as u64 + PAGE_SIZE as u64 - 1;
        count += padded.div_ceil(MAX_DESCRIPTOR_TRANSFER as u64) as usize;
        if force_short && size >= max_packet_size as u32 {
            count += 1;
        }
    } else if force_short || !control {
        count += 1;
    }

    Ok(count)
}

/// Descriptors needed for this exact request
pub fn submission_count(
    transfer_type: TransferType,
    request: &TransferRequest,
    max_packet_size: u16,
) -> Result<usize> {
    let control = transfer_type == TransferType::Control;
    let force_short = request.flags.contains(TransferFlags::FORCE_SHORT_TRANSFER);
    let mut offset = page_offset(request.buffer_physical);
    let mut data = request.length;
    let mut count = 0;

    if control {
        data = data
            .checked_sub(SETUP_PACKET_SIZE)
            .ok_or(UsbError::InvalidParameter)?;
        count += 2;
        offset = (offset + SETUP_PACKET_SIZE) % PAGE_SIZE as u32;
    }

    if data != 0 {
        let span = data as u64 + offset as u64;
        count += span.div_ceil(MAX_DESCRIPTOR_TRANSFER as u64) as usize;
        if force_short && max_packet_size != 0 && data % max_packet_size as u32 == 0 {
            count += 1;
        }
    } else if force_short || !control {
        count += 1;
    }

    Ok(count)
}

/// Role of one descriptor within a set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Control setup packet
    Setup,
    /// Data (possibly zero length)
    Data,
    /// Control status handshake
    Status,
}

/// Byte range one descriptor covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Role of the descriptor
    pub kind: StageKind,
    /// Offset into the caller's buffer
    pub offset: u32,
    /// Bytes to move
    pub length: u32,
}

/// Splits a request into `count` stages
///
/// Data chunks end on the five page budget of a descriptor, so every chunk
/// after the first starts page aligned.
#[derive(Debug, Clone)]
pub struct StagePlan {
    control: bool,
    length: u32,
    count: usize,
    index: usize,
    offset: u32,
    page_offset: u32,
}

impl StagePlan {
    /// Plan for a request that needs `count` descriptors
    pub fn new(transfer_type: TransferType, request: &TransferRequest, count: usize) -> Self {
        Self {
            control: transfer_type == TransferType::Control,
            length: request.length,
            count,
            index: 0,
            offset: 0,
            page_offset: page_offset(request.buffer_physical),
        }
    }
}

impl Iterator for StagePlan {
    type Item = Stage;

    fn next(&mut self) -> Option<Stage> {
        if self.index == self.count {
            return None;
        }

        let (kind, length) = if self.control && self.index == 0 {
            (StageKind::Setup, SETUP_PACKET_SIZE)
        } else if self.control && self.index == self.count - 1 {
            (StageKind::Status, 0)
        } else {
            let budget = MAX_DESCRIPTOR_TRANSFER - self.page_offset;
            let remaining = self.length.saturating_sub(self.offset);
            (StageKind::Data, budget.min(remaining))
        };

        let stage = Stage {
            kind,
            offset: self.offset,
            length,
        };

        self.offset += length;
        self.page_offset = (self.page_offset + length) % PAGE_SIZE as u32;
        self.index += 1;
        Some(stage)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.index;
        (left, Some(left))
    }
}

/// Token for a stage
///
/// `toggle` carries the data toggle across the stages of a control transfer;
/// other transfer types leave the toggle to the queue head.
pub fn stage_token(
    stage: &Stage,
    direction: Direction,
    control: bool,
    toggle: &mut bool,
    interrupt: bool,
) -> u32 {
    let data_pid = match direction {
        Direction::In => token::PID_IN,
        Direction::Out => token::PID_OUT,
    };

    match stage.kind {
        StageKind::Setup => {
            *toggle = true;
            token::active(stage.length, token::PID_SETUP, false, interrupt)
        }
        StageKind::Status => {
            let pid = match direction {
                Direction::In => token::PID_OUT,
                Direction::Out => token::PID_IN,
            };

            token::active(0, pid, true, interrupt)
        }
        StageKind::Data => {
            let data_toggle = if control {
                let current = *toggle;
                *toggle = !current;
                current
            } else {
                false
            };

            token::active(stage.length, data_pid, data_toggle, interrupt)
        }
    }
}

/// Program a descriptor for `stage`; the token is written last
pub fn program_descriptor(
    descriptor: &QueueTD,
    buffer_physical: u32,
    stage: &Stage,
    stage_token: u32,
    next: u32,
    alt_next: u32,
) {
    descriptor.set_buffer(buffer_physical.wrapping_add(stage.offset), stage.length);
    descriptor.next_qtd.store(next, Ordering::Relaxed);
    descriptor.alt_next_qtd.store(alt_next, Ordering::Relaxed);
    write_ordered(&descriptor.token, stage_token);
}
