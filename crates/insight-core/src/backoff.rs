//! Escalating backoff for rate-limit (HTTP 429) signals.
//!
//! # States
//!
//! ```text
//! NORMAL --[429]--> BACKING_OFF(initial) --[429]--> BACKING_OFF(min(prev * m, max)) ...
//!    ^                                                         |
//!    +------------------[reset on a token success without 429]--+
//! ```
//!
//! The wait returned for a rate-limit signal grows multiplicatively while
//! signals keep arriving and snaps back to the initial value once a token
//! completes without being rate limited.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tunables for the backoff state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Wait applied on the first rate-limit signal.
    pub initial: Duration,
    /// Upper bound for any single wait.
    pub max: Duration,
    /// Growth factor applied on each further signal.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Current state of the backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffState {
    /// No rate limit seen since the last reset.
    Normal,
    /// Rate limited; `current` is the wait that was last applied.
    BackingOff { current: Duration, strikes: u32 },
}

impl std::fmt::Display for BackoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffState::Normal => write!(f, "normal"),
            BackoffState::BackingOff { current, strikes } => {
                write!(f, "backing-off({}s, strikes={strikes})", current.as_secs())
            }
        }
    }
}

/// Shared, thread-safe backoff handle.
///
/// Clones share the same state, so the orchestrator can hand a clone to
/// every token fetcher and observe escalation across the whole batch.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    config: BackoffConfig,
    state: Arc<Mutex<BackoffState>>,
}

impl RateLimitBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BackoffState::Normal)),
        }
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned backoff mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> BackoffState {
        *self.lock_state()
    }

    /// The wait the next rate-limit signal would start from.
    pub fn current(&self) -> Duration {
        match self.state() {
            BackoffState::Normal => self.config.initial,
            BackoffState::BackingOff { current, .. } => current,
        }
    }

    /// Rate-limit signals seen since the last reset.
    pub fn strikes(&self) -> u32 {
        match self.state() {
            BackoffState::Normal => 0,
            BackoffState::BackingOff { strikes, .. } => strikes,
        }
    }

    /// Record a rate-limit signal and return how long to wait now.
    pub fn on_rate_limited(&self) -> Duration {
        let mut state = self.lock_state();
        let (wait, strikes) = match *state {
            BackoffState::Normal => (self.config.initial.min(self.config.max), 1),
            BackoffState::BackingOff { current, strikes } => {
                let grown = Duration::from_secs_f64(
                    current.as_secs_f64() * self.config.multiplier.max(1.0),
                );
                (grown.min(self.config.max), strikes + 1)
            }
        };
        *state = BackoffState::BackingOff {
            current: wait,
            strikes,
        };
        tracing::debug!(wait_secs = wait.as_secs(), strikes, "Rate-limit backoff escalated");
        wait
    }

    /// Return to the normal state after a successful token.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        if *state != BackoffState::Normal {
            tracing::info!(previous = %*state, "Rate-limit backoff reset");
        }
        *state = BackoffState::Normal;
    }
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
