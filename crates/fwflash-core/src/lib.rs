//! fwflash-core - Synchronous storage on top of asynchronous firmware flash
//!
//! Some platforms keep their flash chips behind firmware: the OS submits a
//! read, write or erase together with a completion token, the firmware does
//! the work out-of-band and later posts a message tagged with that token.
//! This crate turns that into an ordinary blocking storage device.
//!
//! # Layers
//!
//! - [`token`] - bounded pool of completion tokens
//! - [`completion`] - token-keyed delivery of completion messages
//! - [`bridge`] - one blocking call per async firmware request
//! - [`device`] - the storage-device contract and [`device::FirmwareFlash`]
//! - [`descriptor`] - flash geometry from a hardware description tree
//!
//! # Example
//!
//! ```ignore
//! use fwflash_core::{bridge::AsyncBridge, context::AsyncContext};
//! use fwflash_core::device::{FirmwareFlash, StorageDeviceExt};
//! use std::sync::Arc;
//!
//! let ctx = AsyncContext::with_defaults();
//! let firmware = Arc::new(MyFirmware::new(ctx.completion_sender()));
//! let bridge = Arc::new(AsyncBridge::new(ctx, firmware));
//!
//! let flash = FirmwareFlash::new(&descriptor, bridge);
//! let (n, data) = flash.read_to_vec(0x1000, 256)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod completion;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod firmware;
pub mod token;

pub use error::{Error, Result, StorageError, StorageResult};
