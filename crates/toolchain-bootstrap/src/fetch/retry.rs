use std::time::Duration;

use tracing::warn;

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::interrupt;

/// One failed attempt of a retried operation.
#[derive(Debug, Clone)]
pub struct TransferError {
    pub retryable: bool,
    pub message: String,
}

impl TransferError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Fixed-delay retry with a hard attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::config("fetch.max_attempts must be at least 1"));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    pub fn from_config(cfg: &FetchConfig) -> Result<Self> {
        Self::new(cfg.max_attempts, Duration::from_secs(cfg.delay_secs))
    }

    /// Calls `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        what: &str,
        sleeper: &dyn Sleeper,
        mut op: impl FnMut(u32) -> std::result::Result<T, TransferError>,
    ) -> Result<T> {
        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            if interrupt::interrupted() {
                return Err(Error::Interrupted);
            }
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !e.retryable => {
                    return Err(Error::fetch(what, e.message));
                }
                Err(e) => {
                    warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e.message,
                        "attempt failed"
                    );
                    last = e.message;
                    if attempt < self.max_attempts {
                        sleeper.sleep(self.delay);
                    }
                }
            }
        }
        Err(Error::fetch(
            what,
            format!("giving up after {} attempts: {last}", self.max_attempts),
        ))
    }
}
