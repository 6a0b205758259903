//! Async completion tokens
//!
//! Every firmware request is tagged with a token so its completion can be
//! matched to the waiting caller. Tokens come from a bounded [`TokenPool`]
//! and must go back exactly once. [`TokenGuard`] ties the release to scope
//! exit so that early returns cannot leak a token.

use crate::error::{Error, Result};
use core::fmt;
use log::error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default number of tokens in a pool
pub const DEFAULT_TOKEN_COUNT: usize = 64;

/// How often an interruptible acquisition re-checks its interrupt signal
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// Identifier correlating a firmware request with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncToken(pub u32);

impl fmt::Display for AsyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External cancellation signal for interruptible token acquisition
///
/// Cloning shares the signal, so one clone can be raised from another thread
/// (a signal handler, a shutdown path) while the other is being waited on.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    raised: Arc<AtomicBool>,
}

impl InterruptSignal {
    /// Create a signal in the cleared state
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; pending interruptible acquisitions give up
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Clear the signal
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Whether the signal is currently raised
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenStats {
    /// Tokens handed out since creation
    pub acquired: u64,
    /// Tokens returned since creation
    pub released: u64,
    /// Tokens currently held
    pub outstanding: usize,
}

struct PoolState {
    /// Free tokens, oldest release first
    free: VecDeque<u32>,
    /// Indexed by token value
    outstanding: Vec<bool>,
    closed: bool,
}

/// Bounded pool of async completion tokens
///
/// Released tokens are handed out again in FIFO order, which keeps a token
/// idle for as long as possible before it is reused.
pub struct TokenPool {
    state: Mutex<PoolState>,
    available: Condvar,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl TokenPool {
    /// Create a pool with `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: (0..capacity as u32).collect(),
                outstanding: vec![false; capacity],
                closed: false,
            }),
            available: Condvar::new(),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Total number of tokens
    pub fn capacity(&self) -> usize {
        self.lock_state().outstanding.len()
    }

    /// Take a token, blocking until one is free
    ///
    /// Fails with `ResourceExhausted` only if the pool is closed.
    pub fn acquire(&self) -> Result<AsyncToken> {
        self.acquire_inner(None)
    }

    /// Take a token, blocking until one is free or `interrupt` is raised
    ///
    /// A free token is handed out even if the signal is already raised; the
    /// signal only aborts an actual wait.
    pub fn acquire_interruptible(&self, interrupt: &InterruptSignal) -> Result<AsyncToken> {
        self.acquire_inner(Some(interrupt))
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> Result<AsyncToken> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(Error::ResourceExhausted);
        }
        self.take_free(&mut state).ok_or(Error::ResourceExhausted)
    }

    /// Return a token to the pool
    ///
    /// Releasing a token that is not outstanding is an invariant violation
    /// and is refused.
    pub fn release(&self, token: AsyncToken) -> Result<()> {
        let mut state = self.lock_state();
        match state.outstanding.get_mut(token.0 as usize) {
            Some(slot) if *slot => *slot = false,
            _ => {
                error!("release of async token {} which is not outstanding", token);
                return Err(Error::TokenNotOutstanding(token));
            }
        }
        state.free.push_back(token.0);
        self.released.fetch_add(1, Ordering::SeqCst);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Whether `token` is currently held by someone
    pub fn is_outstanding(&self, token: AsyncToken) -> bool {
        self.lock_state()
            .outstanding
            .get(token.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Current counters
    pub fn stats(&self) -> TokenStats {
        let state = self.lock_state();
        TokenStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            outstanding: state.outstanding.iter().filter(|&&held| held).count(),
        }
    }

    /// Stop handing out tokens and wake every waiting acquirer
    ///
    /// Tokens that are still outstanding can be released normally.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.available.notify_all();
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn acquire_inner(&self, interrupt: Option<&InterruptSignal>) -> Result<AsyncToken> {
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(Error::ResourceExhausted);
            }
            if let Some(token) = self.take_free(&mut state) {
                return Ok(token);
            }
            state = match interrupt {
                Some(signal) => {
                    if signal.is_raised() {
                        return Err(Error::Interrupted);
                    }
                    self.available
                        .wait_timeout(state, INTERRUPT_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn take_free(&self, state: &mut PoolState) -> Option<AsyncToken> {
        let id = state.free.pop_front()?;
        state.outstanding[id as usize] = true;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(AsyncToken(id))
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_COUNT)
    }
}

/// Scoped ownership of one token
///
/// The token goes back to its pool when the guard is dropped.
pub struct TokenGuard<'a> {
    pool: &'a TokenPool,
    token: AsyncToken,
}

impl<'a> TokenGuard<'a> {
    /// Take ownership of a token previously acquired from `pool`
    pub fn new(pool: &'a TokenPool, token: AsyncToken) -> Self {
        Self { pool, token }
    }

    /// The guarded token
    pub fn token(&self) -> AsyncToken {
        self.token
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        // Already logged by the pool
        let _ = self.pool.release(self.token);
    }
}
