//! Firmware-managed flash device
//!
//! `FirmwareFlash` is the storage-device face of one flash chip owned by
//! firmware. It holds the chip's firmware handle and fixed metadata and
//! forwards every call to the [`AsyncBridge`].

use crate::bridge::{AsyncBridge, Operation};
use crate::descriptor::FlashDescriptor;
use crate::device::erase::{EraseOutcome, EraseReport, EraseRequest};
use crate::device::info::{DeviceFlags, DeviceInfo, DeviceType};
use crate::device::storage::StorageDevice;
use crate::error::{StorageError, StorageResult};
use crate::firmware::DeviceHandle;
use log::{debug, error, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// How `erase` hands back control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseMode {
    /// Erase before returning; the report is `Completed`
    #[default]
    Immediate,
    /// Erase on a background thread; the report is `Queued`
    Deferred,
}

/// Storage device backed by asynchronous firmware flash calls
pub struct FirmwareFlash {
    handle: DeviceHandle,
    info: DeviceInfo,
    bridge: Arc<AsyncBridge>,
    erase_mode: EraseMode,
    deferred: Mutex<Vec<JoinHandle<()>>>,
}

impl FirmwareFlash {
    /// Create the device described by `descriptor`
    ///
    /// The descriptor has already been validated, so the device has full
    /// geometry from the start.
    pub fn new(descriptor: &FlashDescriptor, bridge: Arc<AsyncBridge>) -> Self {
        let info = DeviceInfo {
            name: descriptor.name.clone(),
            device_type: DeviceType::NandFlash,
            flags: DeviceFlags::CAP_NANDFLASH,
            size: descriptor.geometry.size,
            erase_size: descriptor.geometry.erase_size,
            write_size: 1,
            write_buf_size: 1,
        };
        debug!(
            "{}: firmware id {}, size 0x{:x}, erase size 0x{:x}",
            info.name, descriptor.handle, info.size, info.erase_size
        );
        Self {
            handle: descriptor.handle,
            info,
            bridge,
            erase_mode: EraseMode::default(),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Select how erase requests are completed
    pub fn with_erase_mode(mut self, mode: EraseMode) -> Self {
        self.erase_mode = mode;
        self
    }

    /// Firmware identifier of the chip
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Erase mode in use
    pub fn erase_mode(&self) -> EraseMode {
        self.erase_mode
    }

    fn spawn_erase(&self, mut request: EraseRequest) -> EraseReport {
        let bridge = Arc::clone(&self.bridge);
        let handle = self.handle;
        let addr = request.addr();

        // The closure owns the request only if the spawn succeeds, so run it
        // through a shared slot to get it back otherwise.
        let slot = Arc::new(Mutex::new(Some(request)));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("erase-{:x}", addr))
            .spawn(move || {
                let taken = worker_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(mut request) = taken {
                    run_erase(&bridge, handle, &mut request);
                }
            });

        match spawned {
            Ok(join) => {
                let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
                self.reap_finished(&mut deferred);
                deferred.push(join);
                EraseReport::Queued
            }
            Err(e) => {
                warn!("{}: cannot defer erase ({}), erasing inline", self.info.name, e);
                request = match slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    Some(request) => request,
                    None => return EraseReport::Queued,
                };
                EraseReport::Completed(run_erase(&self.bridge, self.handle, &mut request))
            }
        }
    }

    /// Join erase threads that have already exited
    fn reap_finished(&self, deferred: &mut Vec<JoinHandle<()>>) {
        let (finished, running): (Vec<_>, Vec<_>) =
            deferred.drain(..).partition(|join| join.is_finished());
        *deferred = running;
        for join in finished {
            if join.join().is_err() {
                error!("{}: deferred erase thread panicked", self.info.name);
            }
        }
    }
}

/// Drive one erase request to a terminal state and notify it
fn run_erase(
    bridge: &AsyncBridge,
    handle: DeviceHandle,
    request: &mut EraseRequest,
) -> EraseOutcome {
    if !request.begin() {
        error!(
            "erase request at 0x{:x} is already {:?}",
            request.addr(),
            request.state()
        );
        let outcome = request.outcome().unwrap_or(EraseOutcome::Failed {
            fail_addr: request.addr(),
        });
        request.notify();
        return outcome;
    }

    let result = bridge.execute(
        handle,
        Operation::Erase {
            offset: request.addr(),
            len: request.len(),
        },
    );
    match result {
        Ok(_) => {
            request.mark_done();
        }
        Err(e) => {
            debug!("erase at 0x{:x} failed: {}", request.addr(), e);
            request.mark_failed();
        }
    }

    let outcome = request.outcome().unwrap_or(EraseOutcome::Failed {
        fail_addr: request.addr(),
    });
    request.notify();
    outcome
}

impl StorageDevice for FirmwareFlash {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.bridge
            .execute(self.handle, Operation::Read { offset, buf })
            .map(|n| n as usize)
            .map_err(StorageError::from)
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.bridge
            .execute(self.handle, Operation::Write { offset, data })
            .map(|n| n as usize)
            .map_err(StorageError::from)
    }

    fn erase(&self, mut request: EraseRequest) -> EraseReport {
        match self.erase_mode {
            EraseMode::Immediate => {
                EraseReport::Completed(run_erase(&self.bridge, self.handle, &mut request))
            }
            EraseMode::Deferred => self.spawn_erase(request),
        }
    }

    fn sync(&self) {
        let pending: Vec<_> = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for join in pending {
            if join.join().is_err() {
                error!("{}: deferred erase thread panicked", self.info.name);
            }
        }
    }
}

impl Drop for FirmwareFlash {
    fn drop(&mut self) {
        self.sync();
    }
}
