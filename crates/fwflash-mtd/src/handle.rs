//! Device handles
//!
//! A [`MtdHandle`] is how consumers reach a registered device. It performs
//! the argument checks of the storage core before the device sees a call:
//!
//! - out-of-range offsets or lengths fail with `InvalidArgument`
//! - zero-length reads and writes succeed with 0 bytes without touching the
//!   device
//! - writes and erases on a device without `WRITEABLE` fail with `ReadOnly`
//! - erases must cover whole erase blocks

use crate::registry::Entry;
use fwflash_core::device::{
    DeviceInfo, EraseOutcome, EraseReport, EraseRequest, StorageDevice,
};
use fwflash_core::{StorageError, StorageResult};
use log::{debug, warn};
use std::sync::mpsc;
use std::sync::Arc;

/// Handle to a registered storage device
#[derive(Clone)]
pub struct MtdHandle {
    entry: Arc<Entry>,
}

impl MtdHandle {
    pub(crate) fn new(entry: Arc<Entry>) -> Self {
        Self { entry }
    }

    /// Device number in the registry
    pub fn index(&self) -> usize {
        self.entry.index
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.entry.device.info().name
    }

    /// Device metadata
    pub fn info(&self) -> &DeviceInfo {
        self.entry.device.info()
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.info().size
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.check_range(offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.entry.device.read(offset, buf)
    }

    /// Read `len` bytes at `offset` into a new buffer
    pub fn read_to_vec(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check_range(offset, len as u64)?;
        let mut buf = vec![0u8; len];
        let n = self.read(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.check_writeable()?;
        self.check_range(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(0);
        }
        self.entry.device.write(offset, data)
    }

    /// Submit an erase request
    ///
    /// On `Err` the device was never called and the request's callback
    /// does not run. On `Ok` the callback runs exactly once, either before
    /// this returns (`Completed`) or later (`Queued`).
    pub fn erase(&self, mut request: EraseRequest) -> StorageResult<EraseReport> {
        self.check_writeable()?;
        self.check_range(request.addr(), request.len())?;

        if request.is_empty() {
            request.begin();
            request.mark_done();
            request.notify();
            return Ok(EraseReport::Completed(EraseOutcome::Done));
        }

        let info = self.info();
        if !info.geometry().is_erase_aligned(request.addr())
            || !info.geometry().is_erase_aligned(request.len())
        {
            debug!(
                "{}: erase 0x{:x}+0x{:x} not aligned to 0x{:x}",
                info.name,
                request.addr(),
                request.len(),
                info.erase_size
            );
            return Err(StorageError::InvalidArgument);
        }

        Ok(self.entry.device.erase(request))
    }

    /// Erase `len` bytes at `addr` and wait for the outcome
    ///
    /// A failed erase maps to `Io`.
    pub fn erase_wait(&self, addr: u64, len: u64) -> StorageResult<()> {
        let (tx, rx) = mpsc::channel();
        let request = EraseRequest::new(addr, len).with_callback(move |request| {
            // The receiver is gone only if the waiter below already returned
            let _ = tx.send(request.outcome());
        });

        let outcome = match self.erase(request)? {
            EraseReport::Completed(outcome) => Some(outcome),
            EraseReport::Queued => rx.recv().ok().flatten(),
        };

        match outcome {
            Some(EraseOutcome::Done) => Ok(()),
            Some(EraseOutcome::Failed { fail_addr }) => {
                warn!("{}: erase failed at 0x{:x}", self.name(), fail_addr);
                Err(StorageError::Io)
            }
            None => Err(StorageError::Io),
        }
    }

    /// Wait for queued device work to finish
    pub fn sync(&self) {
        self.entry.device.sync();
    }

    fn check_range(&self, offset: u64, len: u64) -> StorageResult<()> {
        let size = self.size();
        if offset > size || len > size - offset {
            debug!(
                "{}: range 0x{:x}+0x{:x} outside device of 0x{:x} bytes",
                self.name(),
                offset,
                len,
                size
            );
            return Err(StorageError::InvalidArgument);
        }
        Ok(())
    }

    fn check_writeable(&self) -> StorageResult<()> {
        if self.info().is_writeable() {
            Ok(())
        } else {
            Err(StorageError::ReadOnly)
        }
    }
}

impl std::fmt::Debug for MtdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtdHandle")
            .field("index", &self.index())
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::StorageRegistry;
    use crate::testing::RamDevice;
    use fwflash_core::device::{EraseRequest, EraseState};
    use fwflash_core::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn setup(dev: RamDevice) -> (Arc<RamDevice>, super::MtdHandle) {
        let dev = Arc::new(dev);
        let registry = StorageRegistry::new();
        registry.register(dev.clone(), &[]).unwrap();
        let handle = registry.get(0).unwrap();
        (dev, handle)
    }

    #[test]
    fn test_range_checks() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));
        let mut buf = [0u8; 16];

        assert_eq!(mtd.read(0x10000 - 8, &mut buf), Err(StorageError::InvalidArgument));
        assert_eq!(mtd.read(u64::MAX, &mut buf), Err(StorageError::InvalidArgument));
        assert_eq!(mtd.write(0x20000, &buf), Err(StorageError::InvalidArgument));
        assert_eq!(dev.calls(), 0);

        assert_eq!(mtd.read(0x10000 - 16, &mut buf), Ok(16));
        assert_eq!(dev.calls(), 1);
    }

    #[test]
    fn test_read_to_vec_checks_range_before_allocating() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));

        assert_eq!(mtd.read_to_vec(0, usize::MAX), Err(StorageError::InvalidArgument));
        assert_eq!(mtd.read_to_vec(0x8000, 0x8001), Err(StorageError::InvalidArgument));
        assert_eq!(dev.calls(), 0);

        assert_eq!(mtd.read_to_vec(0x8000, 0x8000).map(|v| v.len()), Ok(0x8000));
        assert_eq!(dev.calls(), 1);
    }

    #[test]
    fn test_zero_length_never_reaches_device() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));
        assert_eq!(mtd.read(0x100, &mut []), Ok(0));
        assert_eq!(mtd.write(0x100, &[]), Ok(0));
        assert_eq!(mtd.read(0x10000, &mut []), Ok(0));
        assert_eq!(dev.calls(), 0);
    }

    #[test]
    fn test_read_only_device() {
        let (dev, mtd) = setup(RamDevice::new("rom", 0x10000, 0x1000).read_only());
        assert_eq!(mtd.write(0, &[0]), Err(StorageError::ReadOnly));
        assert_eq!(
            mtd.erase(EraseRequest::new(0, 0x1000)).unwrap_err(),
            StorageError::ReadOnly
        );
        assert_eq!(dev.calls(), 0);
    }

    #[test]
    fn test_invalid_erase_fails_before_device() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));
        let fired = Arc::new(AtomicUsize::new(0));

        for (addr, len) in [(0x100, 0x1000), (0x1000, 0x800), (0xF000, 0x2000)] {
            let seen = Arc::clone(&fired);
            let request = EraseRequest::new(addr, len).with_callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(mtd.erase(request).unwrap_err(), StorageError::InvalidArgument);
        }
        assert_eq!(dev.calls(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_length_erase_completes_without_device() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));
        let state = Arc::new(std::sync::Mutex::new(None));
        let seen = Arc::clone(&state);
        let request = EraseRequest::new(0x1000, 0).with_callback(move |r| {
            *seen.lock().unwrap() = Some(r.state());
        });
        assert!(mtd.erase(request).is_ok());
        assert_eq!(*state.lock().unwrap(), Some(EraseState::Done));
        assert_eq!(dev.calls(), 0);
    }

    #[test]
    fn test_erase_wait() {
        let (dev, mtd) = setup(RamDevice::new("ram", 0x10000, 0x1000));
        mtd.write(0x2000, &[0u8; 32]).unwrap();
        assert_eq!(mtd.erase_wait(0x2000, 0x1000), Ok(()));
        assert!(dev.contents()[0x2000..0x3000].iter().all(|&b| b == 0xFF));

        dev.fail_erases_at(0x3000);
        assert_eq!(mtd.erase_wait(0x3000, 0x1000), Err(StorageError::Io));
    }
}
