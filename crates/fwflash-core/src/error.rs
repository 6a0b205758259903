//! Error types for fwflash-core
//!
//! Two layers of errors live here:
//!
//! - [`Error`] is what the token pool, completion channel and async bridge
//!   report. It keeps enough detail (operation, firmware status, token) to
//!   produce a useful log line.
//! - [`StorageError`] is the coarse signal handed to the generic storage
//!   layer. Every [`Error`] collapses into one of its variants.

use crate::firmware::{FirmwareStatus, OperationKind};
use crate::token::AsyncToken;
use thiserror::Error;

/// Error reported by the async operation machinery
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Token pool
    /// No completion token is available
    #[error("no async completion token available")]
    ResourceExhausted,
    /// Token acquisition was aborted by a pending interrupt
    #[error("interrupted while waiting for an async completion token")]
    Interrupted,
    /// A token was released that is not currently outstanding
    #[error("async token {0} is not outstanding")]
    TokenNotOutstanding(AsyncToken),

    // Completion channel
    /// A waiter is already registered for this token
    #[error("async token {0} already has a registered waiter")]
    TokenInUse(AsyncToken),
    /// A completion arrived that no context is waiting for
    #[error("unexpected completion for async token {0}")]
    UnexpectedCompletion(AsyncToken),
    /// The wait for a completion was cancelled before a message arrived
    #[error("wait for async token {0} was abandoned")]
    WaitAbandoned(AsyncToken),
    /// The completion channel has been shut down
    #[error("completion channel is closed")]
    ChannelClosed,

    // Firmware
    /// Firmware refused to accept the operation for asynchronous execution
    #[error("firmware rejected {op} request (rc {status})")]
    DispatchRejected {
        /// Operation that was submitted
        op: OperationKind,
        /// Status returned by the submit call
        status: FirmwareStatus,
    },
    /// Firmware completed the operation with a non-success status
    #[error("firmware {op} request failed (rc {status})")]
    IoFailure {
        /// Operation that completed
        op: OperationKind,
        /// Status carried by the completion message
        status: FirmwareStatus,
    },
    /// Completion payload does not match the request
    #[error("firmware returned {actual} bytes for a {expected} byte {op}")]
    PayloadMismatch {
        /// Operation that completed
        op: OperationKind,
        /// Requested length
        expected: usize,
        /// Length of the returned payload
        actual: usize,
    },
}

impl Error {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;

/// Generic storage-layer failure signal
///
/// This is the only error shape the storage registry and its consumers see.
/// The variants mirror the errno classes a block/MTD layer hands back to
/// its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (EIO)
    #[error("I/O error")]
    Io,
    /// Out of memory or completion resources (ENOMEM)
    #[error("out of resources")]
    NoMemory,
    /// Interrupted, the caller may retry (EINTR)
    #[error("interrupted")]
    Interrupted,
    /// Invalid offset, length or request (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
    /// Device is not writeable (EROFS)
    #[error("device is read-only")]
    ReadOnly,
}

impl StorageError {
    /// Negative errno value for this error class
    pub fn errno(self) -> i32 {
        match self {
            Self::Io => -5,
            Self::NoMemory => -12,
            Self::Interrupted => -4,
            Self::InvalidArgument => -22,
            Self::ReadOnly => -30,
        }
    }
}

impl From<Error> for StorageError {
    fn from(err: Error) -> Self {
        match err {
            Error::ResourceExhausted => StorageError::NoMemory,
            Error::Interrupted => StorageError::Interrupted,
            Error::TokenNotOutstanding(_) | Error::TokenInUse(_) => StorageError::InvalidArgument,
            Error::UnexpectedCompletion(_)
            | Error::WaitAbandoned(_)
            | Error::ChannelClosed
            | Error::DispatchRejected { .. }
            | Error::IoFailure { .. }
            | Error::PayloadMismatch { .. } => StorageError::Io,
        }
    }
}

/// Result type for storage-layer calls
pub type StorageResult<T> = core::result::Result<T, StorageError>;
