//! Async operation bridge
//!
//! Turns one asynchronous firmware call into one blocking call:
//!
//! ```text
//! acquire token ──► register waiter ──► submit ──► wait ──► decode status
//!       │                  │               │         │
//!       └──────────────────┴─── released on every exit path ───┘
//! ```
//!
//! The bridge never retries. A rejected submit and a failed completion are
//! both reported as they are; retry policy belongs to whoever calls it.

use crate::context::{AcquirePolicy, AsyncContext};
use crate::error::{Error, Result};
use crate::firmware::{DeviceHandle, FirmwareRequest, FlashFirmware, OperationKind};
use crate::token::{AsyncToken, TokenGuard};
use log::{debug, error};
use std::sync::Arc;

/// A flash operation together with its buffer
#[derive(Debug)]
pub enum Operation<'a> {
    /// Read into `buf`, which also gives the length
    Read {
        /// Flash offset
        offset: u64,
        /// Destination buffer
        buf: &'a mut [u8],
    },
    /// Write `data`
    Write {
        /// Flash offset
        offset: u64,
        /// Source data
        data: &'a [u8],
    },
    /// Erase `len` bytes, no buffer
    Erase {
        /// Flash offset
        offset: u64,
        /// Number of bytes
        len: u64,
    },
}

impl Operation<'_> {
    /// Operation kind
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::Erase { .. } => OperationKind::Erase,
        }
    }

    /// Starting flash offset
    pub fn offset(&self) -> u64 {
        match self {
            Self::Read { offset, .. } | Self::Write { offset, .. } | Self::Erase { offset, .. } => {
                *offset
            }
        }
    }

    /// Requested length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Read { buf, .. } => buf.len() as u64,
            Self::Write { data, .. } => data.len() as u64,
            Self::Erase { len, .. } => *len,
        }
    }

    /// Whether the operation covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blocking front end to an asynchronous flash firmware
pub struct AsyncBridge {
    ctx: Arc<AsyncContext>,
    firmware: Arc<dyn FlashFirmware>,
}

impl AsyncBridge {
    /// Create a bridge issuing requests to `firmware` through `ctx`
    pub fn new(ctx: Arc<AsyncContext>, firmware: Arc<dyn FlashFirmware>) -> Self {
        Self { ctx, firmware }
    }

    /// The async context this bridge uses
    pub fn context(&self) -> &Arc<AsyncContext> {
        &self.ctx
    }

    /// Run `op` on `device` and wait for the firmware to complete it
    ///
    /// Returns the number of bytes transferred, which is always the requested
    /// length. On failure nothing about the transfer is reported; for reads
    /// the buffer content is unspecified.
    ///
    /// # Errors
    /// * `Interrupted` - the interrupt signal was raised while waiting for a token
    /// * `ResourceExhausted` - no token could be obtained
    /// * `DispatchRejected` - firmware refused the request
    /// * `WaitAbandoned` - the wait was cancelled before a completion arrived
    /// * `IoFailure` - firmware completed the request with an error status
    /// * `PayloadMismatch` - a read completion carried the wrong amount of data
    pub fn execute(&self, device: DeviceHandle, op: Operation<'_>) -> Result<u64> {
        let kind = op.kind();
        let offset = op.offset();
        let len = op.len();

        debug!(
            "async op (dev={}, op={}, offset=0x{:x}, len={})",
            device, kind, offset, len
        );

        let token = self.acquire_token().map_err(|e| {
            error!("Failed to get an async token: {}", e);
            e
        })?;
        // Declared after the guard so the registration goes away before the
        // token does.
        let waiter = self.ctx.completions().register(token.token())?;

        let (request, read_buf) = match op {
            Operation::Read { offset, buf } => (
                FirmwareRequest::Read {
                    offset,
                    len: buf.len(),
                },
                Some(buf),
            ),
            Operation::Write { offset, data } => (
                FirmwareRequest::Write {
                    offset,
                    data: data.to_vec(),
                },
                None,
            ),
            Operation::Erase { offset, len } => (FirmwareRequest::Erase { offset, len }, None),
        };

        let rc = self.firmware.submit(device, request, token.token());
        if !rc.is_accepted() {
            error!("firmware {} request failed (rc {})", kind, rc);
            return Err(Error::DispatchRejected { op: kind, status: rc });
        }

        let message = waiter.wait().map_err(|e| {
            error!("async wait failed: {}", e);
            e
        })?;
        drop(token);

        if !message.status.is_success() {
            error!(
                "firmware {} at 0x{:x} completed with rc {}",
                kind, offset, message.status
            );
            return Err(Error::IoFailure {
                op: kind,
                status: message.status,
            });
        }

        if let Some(buf) = read_buf {
            if message.payload.len() != buf.len() {
                error!(
                    "firmware returned {} bytes for a {} byte read",
                    message.payload.len(),
                    buf.len()
                );
                return Err(Error::PayloadMismatch {
                    op: kind,
                    expected: buf.len(),
                    actual: message.payload.len(),
                });
            }
            buf.copy_from_slice(&message.payload);
        }

        Ok(len)
    }

    fn acquire_token(&self) -> Result<TokenGuard<'_>> {
        let pool = self.ctx.tokens();
        let token: AsyncToken = match self.ctx.config().acquire {
            AcquirePolicy::Wait => pool.acquire_interruptible(self.ctx.interrupt())?,
            AcquirePolicy::NoWait => pool.try_acquire()?,
        };
        Ok(TokenGuard::new(pool, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionSender;
    use crate::context::ContextConfig;
    use crate::firmware::{CompletionMessage, FirmwareStatus};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// What the scripted firmware does with the next request
    #[derive(Clone, Copy)]
    enum Script {
        /// Refuse the submit with this status
        Reject(FirmwareStatus),
        /// Accept, then complete from another thread with this status
        Complete(FirmwareStatus),
        /// Accept and never complete
        Hang,
    }

    struct ScriptedFirmware {
        sender: CompletionSender,
        script: Script,
        requests: Mutex<Vec<(DeviceHandle, FirmwareRequest)>>,
        tokens: Mutex<Vec<AsyncToken>>,
    }

    impl ScriptedFirmware {
        fn new(ctx: &AsyncContext, script: Script) -> Arc<Self> {
            Arc::new(Self {
                sender: ctx.completion_sender(),
                script,
                requests: Mutex::new(Vec::new()),
                tokens: Mutex::new(Vec::new()),
            })
        }
    }

    impl FlashFirmware for ScriptedFirmware {
        fn submit(
            &self,
            device: DeviceHandle,
            request: FirmwareRequest,
            token: AsyncToken,
        ) -> FirmwareStatus {
            self.requests.lock().unwrap().push((device, request.clone()));
            self.tokens.lock().unwrap().push(token);
            match self.script {
                Script::Reject(status) => status,
                Script::Hang => FirmwareStatus::ASYNC_COMPLETION,
                Script::Complete(status) => {
                    let payload = match &request {
                        FirmwareRequest::Read { offset, len } => {
                            (0..*len).map(|i| (*offset as usize + i) as u8).collect()
                        }
                        _ => Vec::new(),
                    };
                    let sender = self.sender.clone();
                    thread::spawn(move || {
                        sender
                            .send(CompletionMessage::with_payload(token, status, payload))
                            .unwrap();
                    });
                    FirmwareStatus::ASYNC_COMPLETION
                }
            }
        }
    }

    fn bridge_with(script: Script) -> (AsyncBridge, Arc<ScriptedFirmware>) {
        let ctx = AsyncContext::with_defaults();
        let firmware = ScriptedFirmware::new(&ctx, script);
        (AsyncBridge::new(ctx, firmware.clone()), firmware)
    }

    fn assert_balanced(bridge: &AsyncBridge) {
        let tokens = bridge.context().token_stats();
        assert_eq!(tokens.acquired, tokens.released);
        assert_eq!(tokens.outstanding, 0);
        let channel = bridge.context().channel_stats();
        assert_eq!(channel.registered, channel.deregistered);
        assert_eq!(channel.pending, 0);
    }

    #[test]
    fn test_read_success_fills_buffer() {
        let (bridge, firmware) = bridge_with(Script::Complete(FirmwareStatus::SUCCESS));
        let mut buf = [0u8; 256];
        let n = bridge
            .execute(
                DeviceHandle(0),
                Operation::Read {
                    offset: 0x1000,
                    buf: &mut buf,
                },
            )
            .unwrap();

        assert_eq!(n, 256);
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[255], 0xFF);
        assert_eq!(
            firmware.requests.lock().unwrap()[0],
            (
                DeviceHandle(0),
                FirmwareRequest::Read {
                    offset: 0x1000,
                    len: 256
                }
            )
        );
        assert_balanced(&bridge);
    }

    #[test]
    fn test_failed_completion_is_io_failure() {
        let (bridge, _) = bridge_with(Script::Complete(FirmwareStatus::HARDWARE));
        let data = [0x5Au8; 64];
        let err = bridge
            .execute(
                DeviceHandle(1),
                Operation::Write {
                    offset: 0x2000,
                    data: &data,
                },
            )
            .unwrap_err();

        assert_eq!(
            err,
            Error::IoFailure {
                op: OperationKind::Write,
                status: FirmwareStatus::HARDWARE
            }
        );
        assert_balanced(&bridge);
    }

    #[test]
    fn test_rejected_dispatch_never_waits() {
        // A hanging wait would block forever, so returning at all shows the
        // channel was not waited on.
        let (bridge, _) = bridge_with(Script::Reject(FirmwareStatus::BUSY));
        let err = bridge
            .execute(
                DeviceHandle(0),
                Operation::Erase {
                    offset: 0x4000,
                    len: 0x1000,
                },
            )
            .unwrap_err();

        assert_eq!(
            err,
            Error::DispatchRejected {
                op: OperationKind::Erase,
                status: FirmwareStatus::BUSY
            }
        );
        assert_balanced(&bridge);
    }

    #[test]
    fn test_success_status_other_than_zero_is_failure() {
        // A stray ASYNC_COMPLETION in a completion is not success
        let (bridge, _) = bridge_with(Script::Complete(FirmwareStatus::ASYNC_COMPLETION));
        let err = bridge
            .execute(
                DeviceHandle(0),
                Operation::Erase {
                    offset: 0,
                    len: 0x1000,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::IoFailure { .. }));
    }

    #[test]
    fn test_interrupt_while_waiting_for_token() {
        let ctx = AsyncContext::new(ContextConfig {
            tokens: 1,
            ..Default::default()
        });
        let firmware = ScriptedFirmware::new(&ctx, Script::Complete(FirmwareStatus::SUCCESS));
        let bridge = AsyncBridge::new(Arc::clone(&ctx), firmware.clone());

        let held = ctx.tokens().acquire().unwrap();
        ctx.interrupt().raise();
        let err = bridge
            .execute(
                DeviceHandle(0),
                Operation::Erase {
                    offset: 0,
                    len: 0x1000,
                },
            )
            .unwrap_err();

        assert_eq!(err, Error::Interrupted);
        assert!(err.is_retryable());
        assert!(firmware.requests.lock().unwrap().is_empty());
        ctx.tokens().release(held).unwrap();
        assert_balanced(&bridge);
    }

    #[test]
    fn test_no_wait_policy_fails_fast() {
        let ctx = AsyncContext::new(ContextConfig {
            tokens: 1,
            acquire: AcquirePolicy::NoWait,
        });
        let firmware = ScriptedFirmware::new(&ctx, Script::Complete(FirmwareStatus::SUCCESS));
        let bridge = AsyncBridge::new(Arc::clone(&ctx), firmware);

        let held = ctx.tokens().acquire().unwrap();
        let err = bridge
            .execute(
                DeviceHandle(0),
                Operation::Erase {
                    offset: 0,
                    len: 0x1000,
                },
            )
            .unwrap_err();
        assert_eq!(err, Error::ResourceExhausted);
        ctx.tokens().release(held).unwrap();
    }

    #[test]
    fn test_shutdown_abandons_hung_wait() {
        let (bridge, _) = bridge_with(Script::Hang);
        let bridge = Arc::new(bridge);

        let handle = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                bridge.execute(
                    DeviceHandle(0),
                    Operation::Erase {
                        offset: 0,
                        len: 0x1000,
                    },
                )
            })
        };
        while bridge.context().channel_stats().pending == 0 {
            thread::yield_now();
        }
        bridge.context().shutdown();

        assert!(matches!(
            handle.join().unwrap(),
            Err(Error::WaitAbandoned(_))
        ));
        assert_balanced(&bridge);
    }

    #[test]
    fn test_interrupt_does_not_abandon_completion_wait() {
        let (bridge, firmware) = bridge_with(Script::Hang);
        let bridge = Arc::new(bridge);

        let handle = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                let result = bridge.execute(
                    DeviceHandle(2),
                    Operation::Read {
                        offset: 0x100,
                        buf: &mut buf,
                    },
                );
                (result, buf)
            })
        };
        while bridge.context().channel_stats().pending == 0 {
            thread::yield_now();
        }

        bridge.context().interrupt().raise();
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        assert_eq!(bridge.context().channel_stats().pending, 1);
        assert_eq!(bridge.context().token_stats().outstanding, 1);

        let token = firmware.tokens.lock().unwrap()[0];
        bridge
            .context()
            .completion_sender()
            .send(CompletionMessage::with_payload(
                token,
                FirmwareStatus::SUCCESS,
                vec![0xDE, 0xAD, 0xBE, 0xEF],
            ))
            .unwrap();

        let (result, buf) = handle.join().unwrap();
        assert_eq!(result, Ok(4));
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_balanced(&bridge);
    }
}
