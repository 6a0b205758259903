//! Erase requests
//!
//! An erase reports its result twice: the call returns an [`EraseReport`],
//! and the request's own state plus callback carry the real outcome. The
//! callback runs exactly once per request, after the state has become
//! terminal.
//!
//! ```text
//! Pending ──► Erasing ──► Done
//!                    └──► Failed (fail_addr)
//! ```

use core::fmt;
use log::error;

/// Lifecycle of an erase request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseState {
    /// Created, not yet started
    Pending,
    /// Handed to the device
    Erasing,
    /// Erase succeeded
    Done,
    /// Erase failed
    Failed,
}

impl EraseState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Final result of an erase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome {
    /// Range erased
    Done,
    /// Erase failed
    Failed {
        /// First address known to have failed
        fail_addr: u64,
    },
}

impl EraseOutcome {
    /// Whether the erase succeeded
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

/// What an erase call returns to its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseReport {
    /// Accepted, the callback will fire later
    Queued,
    /// Finished before returning, the callback has already fired
    Completed(EraseOutcome),
}

/// Erase completion notification
pub type EraseCallback = Box<dyn FnOnce(&EraseRequest) + Send>;

/// A request to erase `len` bytes at `addr`
pub struct EraseRequest {
    addr: u64,
    len: u64,
    state: EraseState,
    fail_addr: Option<u64>,
    callback: Option<EraseCallback>,
}

impl EraseRequest {
    /// Create a pending request without a callback
    pub fn new(addr: u64, len: u64) -> Self {
        Self {
            addr,
            len,
            state: EraseState::Pending,
            fail_addr: None,
            callback: None,
        }
    }

    /// Attach the completion callback
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&EraseRequest) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Start address
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the request covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current state
    pub fn state(&self) -> EraseState {
        self.state
    }

    /// Failing address, only set in the `Failed` state
    pub fn fail_addr(&self) -> Option<u64> {
        self.fail_addr
    }

    /// Outcome, once the state is terminal
    pub fn outcome(&self) -> Option<EraseOutcome> {
        match self.state {
            EraseState::Done => Some(EraseOutcome::Done),
            EraseState::Failed => Some(EraseOutcome::Failed {
                fail_addr: self.fail_addr.unwrap_or(self.addr),
            }),
            EraseState::Pending | EraseState::Erasing => None,
        }
    }

    /// `Pending → Erasing`
    ///
    /// Returns false, leaving the state alone, from any other state.
    pub fn begin(&mut self) -> bool {
        self.transition(EraseState::Pending, EraseState::Erasing)
    }

    /// `Erasing → Done`
    pub fn mark_done(&mut self) -> bool {
        self.transition(EraseState::Erasing, EraseState::Done)
    }

    /// `Erasing → Failed`, recording the request address as failing
    pub fn mark_failed(&mut self) -> bool {
        if !self.transition(EraseState::Erasing, EraseState::Failed) {
            return false;
        }
        self.fail_addr = Some(self.addr);
        true
    }

    /// Run the completion callback if it has not run yet
    ///
    /// Returns whether the callback ran.
    pub fn notify(&mut self) -> bool {
        match self.callback.take() {
            Some(callback) => {
                callback(self);
                true
            }
            None => false,
        }
    }

    /// Detach the callback, leaving the request without one
    pub fn take_callback(&mut self) -> Option<EraseCallback> {
        self.callback.take()
    }

    /// Copy of this request with addresses shifted down by `base`
    ///
    /// The copy has no callback. Used to present a request issued at a
    /// parent device address in a child's address space.
    pub fn rebased(&self, base: u64) -> EraseRequest {
        EraseRequest {
            addr: self.addr.saturating_sub(base),
            len: self.len,
            state: self.state,
            fail_addr: self.fail_addr.map(|addr| addr.saturating_sub(base)),
            callback: None,
        }
    }

    fn transition(&mut self, from: EraseState, to: EraseState) -> bool {
        if self.state != from {
            error!(
                "erase request at 0x{:x}: invalid transition {:?} -> {:?}",
                self.addr, self.state, to
            );
            return false;
        }
        self.state = to;
        true
    }
}

impl fmt::Debug for EraseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EraseRequest")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("state", &self.state)
            .field("fail_addr", &self.fail_addr)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
