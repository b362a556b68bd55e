use std::{ops::Deref, time::Duration};

use crate::QuotaBucketError;

/// Expiry applied while a bucket is only half-initialized.
pub(crate) const BOOTSTRAP_TTL_SECONDS: u64 = 30;

/// Expiry applied by `set` and `burst`.
pub(crate) const ADMIN_TTL_SECONDS: u64 = 60 * 60 * 24 * 7;

pub(crate) const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Largest increment `burst` accepts; Redis hash counters are signed 64-bit.
pub(crate) const MAX_BURST_TOKENS: u64 = i64::MAX as u64;

pub(crate) fn validate_burst_tokens(tokens: u64) -> Result<(), QuotaBucketError> {
    if tokens > MAX_BURST_TOKENS {
        Err(QuotaBucketError::InvalidTokens(format!(
            "Burst tokens must not exceed {MAX_BURST_TOKENS}"
        )))
    } else {
        Ok(())
    }
}

/// Steady-state expiry for a bucket: three intervals, rounded up to whole
/// seconds and never zero.
pub(crate) fn steady_ttl_seconds(interval_nanos: u64) -> u64 {
    interval_nanos
        .saturating_mul(3)
        .div_ceil(NANOS_PER_SECOND)
        .max(1)
}

/// Token capacity of a bucket (tokens per interval).
///
/// Must be at least 1. Defaults to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tokens(u64);

impl Default for Tokens {
    fn default() -> Self {
        Self(1)
    }
}

impl Deref for Tokens {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for Tokens {
    type Error = QuotaBucketError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(QuotaBucketError::InvalidTokens(
                "Tokens must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Length of one refill period.
///
/// Must be non-zero and representable as a `u64` of nanoseconds. Defaults to
/// one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefillInterval(Duration);

impl RefillInterval {
    /// The interval in nanoseconds, the unit stored alongside each bucket.
    pub fn as_nanos_u64(&self) -> u64 {
        // bounded by the TryFrom check
        self.0.as_nanos() as u64
    }
}

impl Default for RefillInterval {
    fn default() -> Self {
        Self(Duration::from_secs(1))
    }
}

impl Deref for RefillInterval {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Duration> for RefillInterval {
    type Error = QuotaBucketError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        if value.is_zero() {
            Err(QuotaBucketError::InvalidRefillInterval(
                "Refill interval must be greater than 0".to_string(),
            ))
        } else if value.as_nanos() > u64::MAX as u128 {
            Err(QuotaBucketError::InvalidRefillInterval(
                "Refill interval must fit in u64 nanoseconds".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Outcome of a `take` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeResult {
    /// Capacity of the bucket.
    pub limit: u64,
    /// Tokens left after this call.
    pub remaining: u64,
    /// Unix time in nanoseconds at which the next refill interval begins.
    ///
    /// Returned whether or not the call was allowed.
    pub reset_at: u64,
    /// Whether a token was consumed.
    pub allowed: bool,
}

/// Raw stored capacity and token count, as returned by `get`.
///
/// No refill is computed, so `remaining` may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSnapshot {
    /// Stored capacity, or 0 if unset.
    pub limit: u64,
    /// Stored token count, or 0 if unset.
    pub remaining: u64,
}
