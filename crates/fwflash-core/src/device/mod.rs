//! Storage devices
//!
//! This module provides the storage-device contract, the erase request
//! state machine, device metadata and [`FirmwareFlash`], the device backed
//! by asynchronous firmware calls.

mod erase;
mod firmware_flash;
mod info;
mod storage;

pub use erase::{EraseCallback, EraseOutcome, EraseReport, EraseRequest, EraseState};
pub use firmware_flash::{EraseMode, FirmwareFlash};
pub use info::{DeviceFlags, DeviceGeometry, DeviceInfo, DeviceType};
pub use storage::{StorageDevice, StorageDeviceExt};
