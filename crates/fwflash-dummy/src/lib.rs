//! fwflash-dummy - In-memory firmware flash emulator
//!
//! This crate provides a dummy firmware that owns emulated flash chips in
//! memory and executes requests out-of-band on a small pool of worker
//! threads, posting a completion for every accepted request. It is useful
//! for testing and development without real firmware.
//!
//! Chips behave like NOR flash: erase sets bytes to 0xFF and programming
//! can only clear bits. Faults can be injected to make the firmware refuse
//! submissions, fail completions or lose requests entirely.

use fwflash_core::completion::CompletionSender;
use fwflash_core::firmware::{
    CompletionMessage, DeviceHandle, FirmwareRequest, FirmwareStatus, FlashFirmware,
    OperationKind,
};
use fwflash_core::token::AsyncToken;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for the dummy firmware
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Number of worker threads executing requests
    pub workers: usize,
    /// Delay before each request is executed
    pub latency: Duration,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            latency: Duration::ZERO,
        }
    }
}

/// What an injected fault does to a matching request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Refuse the submission with this status
    Reject(FirmwareStatus),
    /// Accept, execute nothing, complete with this status
    Fail(FirmwareStatus),
    /// Accept and never complete
    Lose,
}

/// An injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Only requests of this kind match; `None` matches all
    pub op: Option<OperationKind>,
    /// Effect on a matching request
    pub action: FaultAction,
    /// Matches left before the fault expires; `None` never expires
    pub remaining: Option<usize>,
}

impl Fault {
    /// Refuse submissions with `status`
    pub fn reject(status: FirmwareStatus) -> Self {
        Self {
            op: None,
            action: FaultAction::Reject(status),
            remaining: None,
        }
    }

    /// Complete requests with `status` without executing them
    pub fn fail(status: FirmwareStatus) -> Self {
        Self {
            op: None,
            action: FaultAction::Fail(status),
            remaining: None,
        }
    }

    /// Accept requests and never complete them
    pub fn lose() -> Self {
        Self {
            op: None,
            action: FaultAction::Lose,
            remaining: None,
        }
    }

    /// Restrict the fault to one kind of operation
    pub fn on(mut self, op: OperationKind) -> Self {
        self.op = Some(op);
        self
    }

    /// Let the fault expire after `count` matches
    pub fn times(mut self, count: usize) -> Self {
        self.remaining = Some(count);
        self
    }

    fn matches(&self, op: OperationKind) -> bool {
        self.op.map_or(true, |wanted| wanted == op) && self.remaining != Some(0)
    }
}

/// One emulated flash chip
struct DummyChip {
    data: Vec<u8>,
    erase_size: u32,
}

impl DummyChip {
    fn range(&self, offset: u64, len: u64) -> Option<std::ops::Range<usize>> {
        let end = offset.checked_add(len)?;
        if end > self.data.len() as u64 {
            return None;
        }
        Some(offset as usize..end as usize)
    }

    fn execute(&mut self, request: &FirmwareRequest) -> (FirmwareStatus, Vec<u8>) {
        let Some(range) = self.range(request.offset(), request.len()) else {
            return (FirmwareStatus::PARAMETER, Vec::new());
        };

        match request {
            FirmwareRequest::Read { .. } => (FirmwareStatus::SUCCESS, self.data[range].to_vec()),
            FirmwareRequest::Write { data, .. } => {
                // Flash programming: can only change 1 -> 0
                for (byte, &new) in self.data[range].iter_mut().zip(data) {
                    *byte &= new;
                }
                (FirmwareStatus::SUCCESS, Vec::new())
            }
            FirmwareRequest::Erase { offset, len } => {
                let erase_size = u64::from(self.erase_size);
                if offset % erase_size != 0 || len % erase_size != 0 {
                    return (FirmwareStatus::PARAMETER, Vec::new());
                }
                self.data[range].fill(0xFF);
                (FirmwareStatus::SUCCESS, Vec::new())
            }
        }
    }
}

struct Job {
    device: DeviceHandle,
    request: FirmwareRequest,
    token: AsyncToken,
    forced: Option<FirmwareStatus>,
}

struct Shared {
    chips: Mutex<HashMap<DeviceHandle, DummyChip>>,
    faults: Mutex<Vec<Fault>>,
    sender: CompletionSender,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn chips(&self) -> MutexGuard<'_, HashMap<DeviceHandle, DummyChip>> {
        self.chips.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First matching fault, consuming one use of it
    fn take_fault(&self, op: OperationKind) -> Option<FaultAction> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let fault = faults.iter_mut().find(|fault| fault.matches(op))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        let action = fault.action;
        faults.retain(|fault| fault.remaining != Some(0));
        Some(action)
    }

    fn run(&self, job: Job) {
        let (status, payload) = match job.forced {
            Some(status) => (status, Vec::new()),
            None => match self.chips().get_mut(&job.device) {
                Some(chip) => chip.execute(&job.request),
                None => (FirmwareStatus::PARAMETER, Vec::new()),
            },
        };
        trace!(
            "dummy: {} dev={} offset=0x{:x} len={} -> rc {}",
            job.request.kind(),
            job.device,
            job.request.offset(),
            job.request.len(),
            status
        );

        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self
            .sender
            .send(CompletionMessage::with_payload(job.token, status, payload))
        {
            warn!("dummy: completion for token {} not delivered: {}", job.token, e);
        }
    }
}

/// Dummy firmware
///
/// Emulates firmware-managed flash chips in memory.
pub struct DummyFirmware {
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DummyFirmware {
    /// Start a dummy firmware posting completions to `sender`
    pub fn new(config: DummyConfig, sender: CompletionSender) -> Self {
        let shared = Arc::new(Shared {
            chips: Mutex::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            sender,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.workers.max(1))
            .filter_map(|i| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                let latency = config.latency;
                thread::Builder::new()
                    .name(format!("dummy-fw-{}", i))
                    .spawn(move || worker_loop(&shared, &rx, latency))
                    .map_err(|e| warn!("dummy: failed to start worker {}: {}", i, e))
                    .ok()
            })
            .collect();

        debug!("dummy firmware started ({} workers)", config.workers.max(1));
        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Create a dummy firmware with default configuration
    pub fn new_default(sender: CompletionSender) -> Self {
        Self::new(DummyConfig::default(), sender)
    }

    /// Add an erased chip of `size` bytes
    pub fn add_chip(&self, device: DeviceHandle, size: usize, erase_size: u32) {
        self.add_chip_with_data(device, erase_size, vec![0xFF; size]);
    }

    /// Add a chip holding `data`
    pub fn add_chip_with_data(&self, device: DeviceHandle, erase_size: u32, data: Vec<u8>) {
        debug!(
            "dummy: chip {} ({} bytes, erase size 0x{:x})",
            device,
            data.len(),
            erase_size
        );
        self.shared
            .chips()
            .insert(device, DummyChip { data, erase_size });
    }

    /// Copy of a chip's contents
    pub fn chip_data(&self, device: DeviceHandle) -> Option<Vec<u8>> {
        self.shared.chips().get(&device).map(|chip| chip.data.clone())
    }

    /// Inject a fault
    pub fn inject(&self, fault: Fault) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of submit calls seen
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    /// Number of completions posted
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Stop accepting requests and wait for the workers to drain the queue
    pub fn shutdown(&self) {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if queue.is_none() {
            return;
        }
        drop(queue);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("dummy: worker thread panicked");
            }
        }
        debug!("dummy firmware stopped");
    }
}

impl FlashFirmware for DummyFirmware {
    fn submit(
        &self,
        device: DeviceHandle,
        request: FirmwareRequest,
        token: AsyncToken,
    ) -> FirmwareStatus {
        self.shared.submitted.fetch_add(1, Ordering::SeqCst);

        if !self.shared.chips().contains_key(&device) {
            warn!("dummy: no chip {}", device);
            return FirmwareStatus::PARAMETER;
        }

        let forced = match self.shared.take_fault(request.kind()) {
            Some(FaultAction::Reject(status)) => return status,
            Some(FaultAction::Lose) => return FirmwareStatus::ASYNC_COMPLETION,
            Some(FaultAction::Fail(status)) => Some(status),
            None => None,
        };

        let job = Job {
            device,
            request,
            token,
            forced,
        };
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref().map(|tx| tx.send(job)) {
            Some(Ok(())) => FirmwareStatus::ASYNC_COMPLETION,
            _ => FirmwareStatus::BUSY,
        }
    }
}

impl Drop for DummyFirmware {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, jobs: &Mutex<Receiver<Job>>, latency: Duration) {
    loop {
        let job = {
            let rx = jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        shared.run(job);
    }
}
