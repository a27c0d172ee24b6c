//! Runtime configuration for the NodeSet controller
//!
//! The binary fills a [`ControllerConfig`] from CLI flags and environment
//! variables; tests construct it directly.

use std::time::Duration;

use crate::comparator::ScaleDownPolicy;

/// Default interval between level-triggered passes
pub const DEFAULT_REQUEUE_SECS: u64 = 30;

/// Default retry interval while an instance is Busy
pub const DEFAULT_BUSY_RETRY_SECS: u64 = 5;

/// Default age after which a persisted Busy flag is considered abandoned
pub const DEFAULT_STALE_BUSY_SECS: u64 = 300;

/// Default first delay after a failed pass
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 5;

/// Default cap on the delay after repeated failures
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Tunables for the reconciler and its error policy
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Requeue interval after a completed pass
    pub requeue_interval: Duration,
    /// Requeue interval when a pass backs off because the instance is Busy
    pub busy_retry_interval: Duration,
    /// A Busy flag older than this is treated as left behind by a crashed pass
    pub stale_busy_after: Duration,
    /// How many excess pods a pass may delete per node
    pub scale_down: ScaleDownPolicy,
    /// First requeue delay after a failed pass
    pub error_backoff_base: Duration,
    /// Upper bound on the failure requeue delay
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_SECS),
            busy_retry_interval: Duration::from_secs(DEFAULT_BUSY_RETRY_SECS),
            stale_busy_after: Duration::from_secs(DEFAULT_STALE_BUSY_SECS),
            scale_down: ScaleDownPolicy::default(),
            error_backoff_base: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
        }
    }
}

impl ControllerConfig {
    /// Check that the intervals are usable
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.requeue_interval.is_zero() {
            return Err(crate::Error::validation("requeue interval must be positive"));
        }
        if self.busy_retry_interval.is_zero() {
            return Err(crate::Error::validation(
                "busy retry interval must be positive",
            ));
        }
        if self.error_backoff_base.is_zero() || self.error_backoff_max < self.error_backoff_base {
            return Err(crate::Error::validation(
                "error backoff must be positive and not exceed its maximum",
            ));
        }
        Ok(())
    }

    /// Delay before retrying after `failures` consecutive failed passes
    ///
    /// Doubles from `error_backoff_base` per failure, capped at
    /// `error_backoff_max`. Jitter is applied by the caller.
    pub fn error_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.error_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.error_backoff_max)
    }
}
