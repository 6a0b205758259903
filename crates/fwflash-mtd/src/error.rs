//! Error types for the storage registry

use fwflash_core::descriptor::DescriptorError;
use thiserror::Error;

/// Registry and driver binding errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A device with this name is already registered
    #[error("Device name '{0}' is already registered")]
    DuplicateName(String),

    /// No such registration
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The node is not handled by this driver
    #[error("Node '{0}' is not compatible with this driver")]
    NotCompatible(String),

    /// The node is already bound to a device
    #[error("Node '{0}' is already bound")]
    AlreadyBound(String),

    /// Partition extends past the end of its master
    #[error("Partition '{name}' (0x{offset:x}+0x{size:x}) exceeds device size 0x{master_size:x}")]
    PartitionOutOfRange {
        /// Partition name
        name: String,
        /// Partition offset in the master
        offset: u64,
        /// Partition size
        size: u64,
        /// Size of the master device
        master_size: u64,
    },

    /// Two partitions share bytes
    #[error("Partitions '{first}' and '{second}' overlap")]
    PartitionOverlap {
        /// Earlier partition
        first: String,
        /// Later partition
        second: String,
    },

    /// Partition of zero size
    #[error("Partition '{0}' is empty")]
    EmptyPartition(String),

    /// The node's description is unusable
    #[error("Probe failed: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
