//! RAM-backed storage device for registry tests

use fwflash_core::device::{
    DeviceFlags, DeviceInfo, DeviceType, EraseReport, EraseRequest, StorageDevice,
};
use fwflash_core::StorageResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct RamDevice {
    info: DeviceInfo,
    data: Mutex<Vec<u8>>,
    bad_addr: Mutex<Option<u64>>,
    calls: AtomicUsize,
}

impl RamDevice {
    pub(crate) fn new(name: &str, size: usize, erase_size: u32) -> Self {
        Self {
            info: DeviceInfo {
                name: name.to_string(),
                device_type: DeviceType::Ram,
                flags: DeviceFlags::CAP_RAM,
                size: size as u64,
                erase_size,
                write_size: 1,
                write_buf_size: 1,
            },
            data: Mutex::new(vec![0xFF; size]),
            bad_addr: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn read_only(mut self) -> Self {
        self.info.flags.remove(DeviceFlags::WRITEABLE);
        self
    }

    /// Make erases covering `addr` fail
    pub(crate) fn fail_erases_at(&self, addr: u64) {
        *self.bad_addr.lock().unwrap() = Some(addr);
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Number of calls that reached the device
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StorageDevice for RamDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = offset as usize;
        buf.copy_from_slice(&self.data.lock().unwrap()[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = offset as usize;
        self.data.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn erase(&self, mut request: EraseRequest) -> EraseReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        request.begin();
        let range = request.addr()..request.addr() + request.len();
        let bad = *self.bad_addr.lock().unwrap();
        if bad.is_some_and(|addr| range.contains(&addr)) {
            request.mark_failed();
        } else {
            self.data.lock().unwrap()[range.start as usize..range.end as usize].fill(0xFF);
            request.mark_done();
        }
        let outcome = request.outcome().unwrap();
        request.notify();
        EraseReport::Completed(outcome)
    }
}
