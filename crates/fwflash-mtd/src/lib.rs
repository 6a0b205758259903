//! fwflash-mtd - Storage device registry
//!
//! This crate is the layer consumers talk to. It keeps a table of storage
//! devices, validates every call before a device sees it, presents fixed
//! partitions as devices of their own, and binds description-tree nodes to
//! firmware flash devices.
//!
//! # Example
//!
//! ```ignore
//! use fwflash_mtd::{FirmwareFlashDriver, StorageRegistry};
//!
//! let registry = Arc::new(StorageRegistry::new());
//! let driver = FirmwareFlashDriver::new(bridge, Arc::clone(&registry));
//! driver.probe_tree(&tree);
//!
//! let pnor = registry.find("pnor").unwrap();
//! let data = pnor.read_to_vec(0x1000, 256)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod driver;
mod error;
mod handle;
mod partition;
mod registry;

#[cfg(test)]
mod testing;

pub use driver::FirmwareFlashDriver;
pub use error::{RegistryError, Result};
pub use handle::MtdHandle;
pub use partition::{validate_partitions, Partition, PartitionDevice};
pub use registry::{RegistrationId, StorageRegistry};
