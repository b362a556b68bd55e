//! The refill-and-take decision procedure, evaluated in process.
//!
//! This is the same algorithm the Redis provider runs server-side as a Lua
//! script (see `redis::take_script`). Both operate on the same five stored
//! fields and apply the same expiries, so a bucket behaves identically whichever
//! provider holds it.

use crate::common::{BOOTSTRAP_TTL_SECONDS, TakeResult, steady_ttl_seconds};

/// Stored fields of one bucket. `None` means the field is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BucketFields {
    /// `s`: Unix nanoseconds of the first write.
    pub start: Option<u64>,
    /// `t`: last refill period processed.
    pub tick: Option<u64>,
    /// `i`: refill period in nanoseconds.
    pub interval: Option<u64>,
    /// `k`: tokens available.
    pub tokens: Option<u64>,
    /// `m`: capacity.
    pub max_tokens: Option<u64>,
}

/// Result of one evaluation: the caller-facing outcome and the expiry (in
/// seconds from `now`) set by the last write, if anything was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evaluation {
    pub result: TakeResult,
    pub expire_after_seconds: Option<u64>,
}

/// Number of whole intervals between `start` and `now`, floored, never negative.
#[inline]
pub(crate) fn current_tick(start: u64, now: u64, interval: u64) -> u64 {
    now.saturating_sub(start) / interval.max(1)
}

/// Tokens replenished after `elapsed_ticks` periods at `fill_rate`, capped at
/// `capacity` and floored.
///
/// `fill_rate` is infinite when the bucket was empty; the cap is what bounds it.
#[inline]
pub(crate) fn available_tokens(elapsed_ticks: u64, capacity: u64, fill_rate: f64) -> u64 {
    let available = (elapsed_ticks as f64 * fill_rate).min(capacity as f64);
    available.floor() as u64
}

/// Refill `fields` for the time elapsed up to `now`, then try to take one
/// token. `fields` is updated in place with everything the procedure persists.
pub(crate) fn refill_and_take(
    fields: &mut BucketFields,
    now: u64,
    default_tokens: u64,
    default_interval: u64,
) -> Evaluation {
    let mut expire_after_seconds = None;

    let start = match fields.start {
        Some(start) => start,
        None => {
            fields.start = Some(now);
            expire_after_seconds = Some(BOOTSTRAP_TTL_SECONDS);
            now
        }
    };

    let mut last_tick = match fields.tick {
        Some(tick) => tick,
        None => {
            fields.tick = Some(0);
            expire_after_seconds = Some(BOOTSTRAP_TTL_SECONDS);
            0
        }
    };

    let capacity = fields.max_tokens.unwrap_or(default_tokens);
    let mut tokens = fields.tokens.unwrap_or(capacity);
    let interval = fields.interval.unwrap_or(default_interval).max(1);

    let tick = current_tick(start, now, interval);
    let reset_at = start.saturating_add(tick.saturating_add(1).saturating_mul(interval));

    if last_tick < tick {
        // rate derives from the pre-refill token count
        let fill_rate = interval as f64 / tokens as f64;
        tokens = available_tokens(tick - last_tick, capacity, fill_rate);
        last_tick = tick;

        fields.start = Some(start);
        fields.tick = Some(last_tick);
        fields.interval = Some(interval);
        fields.tokens = Some(tokens);
        expire_after_seconds = Some(steady_ttl_seconds(interval));
    }

    if tokens > 0 {
        tokens -= 1;
        fields.tokens = Some(tokens);

        return Evaluation {
            result: TakeResult {
                limit: capacity,
                remaining: tokens,
                reset_at,
                allowed: true,
            },
            expire_after_seconds: Some(steady_ttl_seconds(interval)),
        };
    }

    Evaluation {
        result: TakeResult {
            limit: capacity,
            remaining: tokens,
            reset_at,
            allowed: false,
        },
        expire_after_seconds,
    }
}
