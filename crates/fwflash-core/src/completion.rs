//! Completion channel
//!
//! An explicit correlation table from token to the slot its caller waits on.
//! Each slot has its own lock and condition variable, so a caller parked on
//! one token never holds anything that another token's delivery needs.
//!
//! The expected sequence for one request is:
//!
//! 1. [`CompletionChannel::register`] the token (before submitting, so a fast
//!    completion cannot arrive ahead of its waiter)
//! 2. submit the request to firmware
//! 3. [`Waiter::wait`] for the message
//!
//! Dropping the [`Waiter`] removes the registration, whichever way the
//! request ended.

use crate::error::{Error, Result};
use crate::firmware::CompletionMessage;
use crate::token::AsyncToken;
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

enum SlotState {
    Waiting,
    Delivered(CompletionMessage),
    Abandoned,
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a waiting slot to `Abandoned`; returns false if it already resolved
    fn abandon(&self) -> bool {
        let mut state = self.lock();
        if !matches!(*state, SlotState::Waiting) {
            return false;
        }
        *state = SlotState::Abandoned;
        drop(state);
        self.ready.notify_all();
        true
    }
}

struct Table {
    waiters: HashMap<AsyncToken, Arc<Slot>>,
    closed: bool,
}

/// Registration counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Waiters registered since creation
    pub registered: u64,
    /// Waiters removed since creation
    pub deregistered: u64,
    /// Waiters currently registered
    pub pending: usize,
}

/// Token-keyed delivery of firmware completions
pub struct CompletionChannel {
    table: Mutex<Table>,
    registered: AtomicU64,
    deregistered: AtomicU64,
}

impl CompletionChannel {
    /// Create an empty, open channel
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                waiters: HashMap::new(),
                closed: false,
            }),
            registered: AtomicU64::new(0),
            deregistered: AtomicU64::new(0),
        }
    }

    /// Handle the firmware side uses to post completions
    pub fn sender(self: &Arc<Self>) -> CompletionSender {
        CompletionSender {
            channel: Arc::clone(self),
        }
    }

    /// Register the single waiter for `token`
    ///
    /// # Errors
    /// * `TokenInUse` - a waiter for this token is already registered
    /// * `ChannelClosed` - the channel has been shut down
    pub fn register(&self, token: AsyncToken) -> Result<Waiter<'_>> {
        let mut table = self.lock_table();
        if table.closed {
            return Err(Error::ChannelClosed);
        }
        if table.waiters.contains_key(&token) {
            return Err(Error::TokenInUse(token));
        }

        let slot = Arc::new(Slot::new());
        table.waiters.insert(token, Arc::clone(&slot));
        self.registered.fetch_add(1, Ordering::SeqCst);
        trace!("registered waiter for async token {}", token);

        Ok(Waiter {
            channel: self,
            token,
            slot,
        })
    }

    /// Hand `message` to the waiter registered for its token
    ///
    /// # Errors
    /// * `UnexpectedCompletion` - nobody is waiting for this token, or its
    ///   waiter already received a message or gave up
    pub fn deliver(&self, message: CompletionMessage) -> Result<()> {
        let token = message.token;
        let slot = self.lock_table().waiters.get(&token).cloned();
        let Some(slot) = slot else {
            warn!("dropping completion for unregistered async token {}", token);
            return Err(Error::UnexpectedCompletion(token));
        };

        let mut state = slot.lock();
        if !matches!(*state, SlotState::Waiting) {
            warn!("dropping extra completion for async token {}", token);
            return Err(Error::UnexpectedCompletion(token));
        }
        *state = SlotState::Delivered(message);
        drop(state);
        slot.ready.notify_all();
        Ok(())
    }

    /// Abandon the wait on `token`
    ///
    /// The waiter wakes with `WaitAbandoned`. Returns false if no waiter is
    /// registered or its message already arrived.
    ///
    /// Firmware may still own the request. Once the token is released and
    /// handed out again, its late completion is delivered to the new waiter.
    /// Only `close` is safe against that.
    pub fn cancel(&self, token: AsyncToken) -> bool {
        let slot = self.lock_table().waiters.get(&token).cloned();
        slot.map(|slot| slot.abandon()).unwrap_or(false)
    }

    /// Refuse new registrations and abandon every pending wait
    pub fn close(&self) {
        let slots: Vec<_> = {
            let mut table = self.lock_table();
            table.closed = true;
            table.waiters.values().cloned().collect()
        };
        for slot in slots {
            slot.abandon();
        }
    }

    /// Whether the channel has been shut down
    pub fn is_closed(&self) -> bool {
        self.lock_table().closed
    }

    /// Whether a waiter is registered for `token`
    pub fn is_registered(&self, token: AsyncToken) -> bool {
        self.lock_table().waiters.contains_key(&token)
    }

    /// Current counters
    pub fn stats(&self) -> ChannelStats {
        let pending = self.lock_table().waiters.len();
        ChannelStats {
            registered: self.registered.load(Ordering::SeqCst),
            deregistered: self.deregistered.load(Ordering::SeqCst),
            pending,
        }
    }

    fn deregister(&self, token: AsyncToken, slot: &Arc<Slot>) {
        let mut table = self.lock_table();
        if let Some(current) = table.waiters.get(&token) {
            if Arc::ptr_eq(current, slot) {
                table.waiters.remove(&token);
                self.deregistered.fetch_add(1, Ordering::SeqCst);
                trace!("deregistered waiter for async token {}", token);
            }
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompletionChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// The registration of one caller waiting on one token
pub struct Waiter<'a> {
    channel: &'a CompletionChannel,
    token: AsyncToken,
    slot: Arc<Slot>,
}

impl Waiter<'_> {
    /// Token this waiter is registered for
    pub fn token(&self) -> AsyncToken {
        self.token
    }

    /// Block until the completion for this token arrives
    ///
    /// There is no timeout. The registration is removed when this returns.
    ///
    /// # Errors
    /// * `WaitAbandoned` - the wait was cancelled or the channel closed
    pub fn wait(self) -> Result<CompletionMessage> {
        let mut state = self.slot.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Abandoned) {
                SlotState::Delivered(message) => return Ok(message),
                SlotState::Abandoned => return Err(Error::WaitAbandoned(self.token)),
                SlotState::Waiting => {
                    *state = SlotState::Waiting;
                    state = self
                        .slot
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.channel.deregister(self.token, &self.slot);
    }
}

/// Firmware-side handle for posting completions
#[derive(Clone)]
pub struct CompletionSender {
    channel: Arc<CompletionChannel>,
}

impl CompletionSender {
    /// Post a completion message
    pub fn send(&self, message: CompletionMessage) -> Result<()> {
        self.channel.deliver(message)
    }
}
