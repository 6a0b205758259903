//! Async operation context
//!
//! `AsyncContext` owns the shared state every async flash call needs: the
//! token pool, the completion channel and the interrupt signal used for
//! interruptible token acquisition. It is created once at init, shared by
//! `Arc` between the firmware and every bridge, and shut down at teardown.

use crate::completion::{ChannelStats, CompletionChannel, CompletionSender};
use crate::token::{InterruptSignal, TokenPool, TokenStats, DEFAULT_TOKEN_COUNT};
use log::{debug, info};
use std::sync::Arc;

/// Token acquisition policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Wait for a free token, abort if the interrupt signal is raised
    #[default]
    Wait,
    /// Fail with `ResourceExhausted` when no token is free
    NoWait,
}

/// Configuration for an [`AsyncContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// Number of completion tokens
    pub tokens: usize,
    /// What to do when all tokens are in use
    pub acquire: AcquirePolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tokens: DEFAULT_TOKEN_COUNT,
            acquire: AcquirePolicy::Wait,
        }
    }
}

/// Shared state for async firmware calls
pub struct AsyncContext {
    config: ContextConfig,
    tokens: TokenPool,
    completions: Arc<CompletionChannel>,
    interrupt: InterruptSignal,
}

impl AsyncContext {
    /// Create a context
    pub fn new(config: ContextConfig) -> Arc<Self> {
        debug!(
            "async context: {} tokens, acquire policy {:?}",
            config.tokens, config.acquire
        );
        Arc::new(Self {
            config,
            tokens: TokenPool::new(config.tokens),
            completions: Arc::new(CompletionChannel::new()),
            interrupt: InterruptSignal::new(),
        })
    }

    /// Create a context with the default configuration
    pub fn with_defaults() -> Arc<Self> {
        Self::new(ContextConfig::default())
    }

    /// Configuration this context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The token pool
    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    /// The completion channel
    pub fn completions(&self) -> &CompletionChannel {
        &self.completions
    }

    /// Handle for the firmware to post completions through
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions.sender()
    }

    /// Interrupt signal checked while waiting for a token
    pub fn interrupt(&self) -> &InterruptSignal {
        &self.interrupt
    }

    /// Token pool counters
    pub fn token_stats(&self) -> TokenStats {
        self.tokens.stats()
    }

    /// Completion channel counters
    pub fn channel_stats(&self) -> ChannelStats {
        self.completions.stats()
    }

    /// Tear down: close the pool and abandon all pending waits
    ///
    /// Calls already waiting for a completion fail with an I/O error; calls
    /// waiting for a token fail with `ResourceExhausted`. Nothing new is
    /// accepted afterwards.
    pub fn shutdown(&self) {
        let pending = self.completions.stats().pending;
        self.tokens.close();
        self.completions.close();
        info!(
            "async context shut down ({} wait(s) abandoned)",
            pending
        );
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.tokens.is_closed()
    }
}
