//! Generic storage-device contract
//!
//! This is the shape a storage registry dispatches to. Implementations get
//! calls with already validated ranges; bounds and alignment checks belong
//! to the registry in front of them.

use crate::device::erase::{EraseReport, EraseRequest};
use crate::device::info::DeviceInfo;
use crate::error::StorageResult;

/// Synchronous storage device
///
/// Calls may arrive concurrently from several threads.
pub trait StorageDevice: Send + Sync {
    /// Static device metadata
    fn info(&self) -> &DeviceInfo;

    /// Read `buf.len()` bytes at `offset`
    ///
    /// Returns the number of bytes read. On error nothing was read as far
    /// as the caller is concerned.
    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Write `data` at `offset`
    ///
    /// Returns the number of bytes written.
    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<usize>;

    /// Erase the range described by `request`
    ///
    /// The return value only says whether the request finished or was
    /// queued. Success or failure is reported through the request's state
    /// and its callback, which fires exactly once.
    fn erase(&self, request: EraseRequest) -> EraseReport;

    /// Wait for queued work to finish
    fn sync(&self) {}
}

/// Convenience methods on top of [`StorageDevice`]
pub trait StorageDeviceExt: StorageDevice {
    /// Read `len` bytes at `offset` into a new buffer
    fn read_to_vec(&self, offset: u64, len: usize) -> StorageResult<(usize, Vec<u8>)> {
        let mut buf = vec![0u8; len];
        let n = self.read(offset, &mut buf)?;
        Ok((n, buf))
    }
}

impl<D: StorageDevice + ?Sized> StorageDeviceExt for D {}
