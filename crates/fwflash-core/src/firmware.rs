//! Firmware flash interface
//!
//! The firmware owns the flash chips and executes read/write/erase requests
//! out-of-band. A request is submitted together with an [`AsyncToken`]; the
//! submit call only says whether the request was accepted. The real result
//! arrives later as a [`CompletionMessage`] tagged with the same token, which
//! the firmware hands to a [`CompletionSender`](crate::completion::CompletionSender).

use crate::token::AsyncToken;
use core::fmt;

/// Opaque firmware-assigned identifier of a flash chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code returned by firmware calls and carried by completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareStatus(pub i64);

impl FirmwareStatus {
    /// Operation succeeded
    pub const SUCCESS: Self = Self(0);
    /// Invalid parameter (bad device, offset or length)
    pub const PARAMETER: Self = Self(-1);
    /// Firmware is busy, try again later
    pub const BUSY: Self = Self(-2);
    /// Only part of the operation completed
    pub const PARTIAL: Self = Self(-3);
    /// Hardware error
    pub const HARDWARE: Self = Self(-6);
    /// Operation not supported
    pub const UNSUPPORTED: Self = Self(-7);
    /// Operation not permitted
    pub const PERMISSION: Self = Self(-8);
    /// Firmware ran out of resources
    pub const RESOURCE: Self = Self(-10);
    /// Internal firmware error
    pub const INTERNAL_ERROR: Self = Self(-11);
    /// Request accepted, completion will be delivered asynchronously
    pub const ASYNC_COMPLETION: Self = Self(-15);

    /// Whether this is the success status
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether a submit call returning this status accepted the request
    pub fn is_accepted(self) -> bool {
        self == Self::ASYNC_COMPLETION
    }
}

impl fmt::Display for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of flash operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Read from flash
    Read,
    /// Write (program) flash
    Write,
    /// Erase a range of erase blocks
    Erase,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Erase => write!(f, "erase"),
        }
    }
}

/// A request handed to the firmware
///
/// Write data is owned by the request since the firmware consumes it after
/// the submit call has returned. Read data comes back in the completion
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareRequest {
    /// Read `len` bytes starting at `offset`
    Read {
        /// Flash offset
        offset: u64,
        /// Number of bytes
        len: usize,
    },
    /// Write `data` starting at `offset`
    Write {
        /// Flash offset
        offset: u64,
        /// Bytes to program
        data: Vec<u8>,
    },
    /// Erase `len` bytes starting at `offset`
    Erase {
        /// Flash offset
        offset: u64,
        /// Number of bytes
        len: u64,
    },
}

impl FirmwareRequest {
    /// Operation kind of this request
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::Erase { .. } => OperationKind::Erase,
        }
    }

    /// Starting flash offset
    pub fn offset(&self) -> u64 {
        match self {
            Self::Read { offset, .. } | Self::Write { offset, .. } | Self::Erase { offset, .. } => {
                *offset
            }
        }
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Read { len, .. } => *len as u64,
            Self::Write { data, .. } => data.len() as u64,
            Self::Erase { len, .. } => *len,
        }
    }

    /// Whether the request covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Firmware completion notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMessage {
    /// Token of the request this message answers
    pub token: AsyncToken,
    /// Completion status
    pub status: FirmwareStatus,
    /// Data returned by a read, empty otherwise
    pub payload: Vec<u8>,
}

impl CompletionMessage {
    /// Completion without payload
    pub fn new(token: AsyncToken, status: FirmwareStatus) -> Self {
        Self {
            token,
            status,
            payload: Vec::new(),
        }
    }

    /// Completion carrying read data
    pub fn with_payload(token: AsyncToken, status: FirmwareStatus, payload: Vec<u8>) -> Self {
        Self {
            token,
            status,
            payload,
        }
    }
}

/// Firmware service executing flash requests out-of-band
///
/// `submit` must not block on the operation itself. It returns
/// [`FirmwareStatus::ASYNC_COMPLETION`] when the request was queued; any
/// other value means it was refused and no completion will ever be sent for
/// `token`.
pub trait FlashFirmware: Send + Sync {
    /// Queue `request` on `device`, to be answered with a completion for `token`
    fn submit(
        &self,
        device: DeviceHandle,
        request: FirmwareRequest,
        token: AsyncToken,
    ) -> FirmwareStatus;
}
