//! Fixed-interval polling used by the readiness waits.
//!
//! Both waits in the pipeline (first boot and service activation) share the
//! same shape: ask a predicate up to `max_attempts` times, sleeping a fixed
//! `interval` between attempts. Exhausting the budget is not an error here;
//! callers decide whether to warn and continue.

use anyhow::Result;
use std::time::Duration;

/// Polling budget for a readiness check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// First-boot initialization inside a fresh VM (~3 minutes)
pub const BOOT_READY: RetryPolicy = RetryPolicy {
    max_attempts: 60,
    interval: Duration::from_secs(3),
};

/// RKE2 service unit activation (~5 minutes)
pub const SERVICE_ACTIVE: RetryPolicy = RetryPolicy {
    max_attempts: 60,
    interval: Duration::from_secs(5),
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

impl RetryPolicy {
    /// Total time spent sleeping if every attempt fails
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Poll `predicate` until it returns `Ok(true)` or the budget runs out
    pub fn poll<F>(&self, operation: &str, predicate: F) -> PollOutcome
    where
        F: FnMut() -> Result<bool>,
    {
        self.poll_with_sleep(operation, predicate, std::thread::sleep)
    }

    /// Same as `poll`, with the sleep function supplied by the caller
    pub fn poll_with_sleep<F, S>(&self, operation: &str, mut predicate: F, mut sleep: S) -> PollOutcome
    where
        F: FnMut() -> Result<bool>,
        S: FnMut(Duration),
    {
        for attempt in 1..=self.max_attempts {
            match predicate() {
                Ok(true) => return PollOutcome::Ready { attempts: attempt },
                Ok(false) => {
                    tracing::debug!(operation, attempt, max = self.max_attempts, "not ready yet");
                }
                // A failing probe is indistinguishable from "not ready" this early
                Err(e) => {
                    tracing::debug!(operation, attempt, error = %e, "probe failed");
                }
            }

            if attempt < self.max_attempts {
                sleep(self.interval);
            }
        }

        PollOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
