//! USB host controller error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// Status codes returned by host controller operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// No available resources (descriptors, endpoint or transfer slots)
    NoResources,
    /// Operation not supported for this endpoint type
    NotSupported,
    /// Operation not implemented (isochronous transfers)
    NotImplemented,
    /// Hardware did not respond within the allotted time
    Timeout,
    /// A transfer reported a hardware error status
    DeviceIoError,
    /// Cancellation lost the race against completion
    TooLate,
    /// The transfer was cancelled
    Cancelled,
    /// Invalid parameter
    InvalidParameter,
    /// Hardware or caller configuration is inconsistent
    InvalidConfiguration,
    /// Invalid state for operation
    InvalidState,
    /// Fewer bytes were transferred than the caller required
    DataLengthMismatch,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoResources => write!(f, "No resources available"),
            Self::NotSupported => write!(f, "Operation not supported"),
            Self::NotImplemented => write!(f, "Not implemented"),
            Self::Timeout => write!(f, "Timeout"),
            Self::DeviceIoError => write!(f, "Device I/O error"),
            Self::TooLate => write!(f, "Too late"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidConfiguration => write!(f, "Invalid configuration"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::DataLengthMismatch => write!(f, "Data length mismatch"),
        }
    }
}

/// Detailed outcome attached to a completed transfer
///
/// The status code says whether a transfer failed; this says why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// No error
    #[default]
    None,
    /// Endpoint halted (STALL handshake or retries exhausted)
    Stalled,
    /// Missed a micro-frame during a split transaction
    MissedMicroframe,
    /// CRC error, timeout or bad PID
    CrcOrTimeout,
    /// Device sent more data than expected
    Babble,
    /// Host could not keep up with the data stream
    DataBuffer,
    /// Short packet on a transfer that required full length
    ShortPacket,
    /// Transfer was cancelled before completion
    Cancelled,
    /// Polled transfer never finished
    Timeout,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Stalled => write!(f, "Stalled"),
            Self::MissedMicroframe => write!(f, "Missed microframe"),
            Self::CrcOrTimeout => write!(f, "CRC or timeout"),
            Self::Babble => write!(f, "Babble detected"),
            Self::DataBuffer => write!(f, "Data buffer error"),
            Self::ShortPacket => write!(f, "Short packet"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Timeout => write!(f, "Timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_default_is_none() {
        assert_eq!(TransferError::default(), TransferError::None);
    }

    #[test]
    fn test_error_is_copy() {
        let e = UsbError::TooLate;
        let f = e;
        assert_eq!(e, f);
    }
}
