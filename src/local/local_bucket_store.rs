use std::{
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use dashmap::DashMap;

use crate::{
    BucketSnapshot, Clock, QuotaBucketError, RefillInterval, SystemClock, TakeResult, Tokens,
    bucket::{BucketFields, refill_and_take},
    common::{ADMIN_TTL_SECONDS, MAX_BURST_TOKENS, NANOS_PER_SECOND, validate_burst_tokens},
    lifecycle::Lifecycle,
};

/// Configuration for [`LocalBucketStore`].
#[derive(Clone, Debug)]
pub struct LocalBucketStoreOptions {
    /// Capacity for keys without a stored override.
    pub tokens: Tokens,
    /// Refill interval for keys without a stored override.
    pub interval: RefillInterval,
    /// Time source for refill arithmetic and expiry.
    pub clock: Arc<dyn Clock>,
}

impl Default for LocalBucketStoreOptions {
    fn default() -> Self {
        Self {
            tokens: Tokens::default(),
            interval: RefillInterval::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LocalBucket {
    fields: BucketFields,
    /// Unix nanoseconds after which the bucket reads as absent.
    expires_at: Option<u64>,
}

impl LocalBucket {
    #[inline]
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    #[inline]
    fn expire_after(&mut self, now: u64, seconds: u64) {
        self.expires_at = Some(now.saturating_add(seconds.saturating_mul(NANOS_PER_SECOND)));
    }
}

/// Token-bucket store held in process memory.
///
/// Same operations and semantics as [`RedisBucketStore`](crate::redis::RedisBucketStore),
/// without the network. Expired buckets behave as absent as soon as they expire
/// and are physically removed by [`LocalBucketStore::cleanup`].
///
/// # Thread Safety
///
/// - Each operation holds the key's [`DashMap`] entry while it runs, so
///   operations on one key are serialized and never observe partial updates
/// - Operations on different keys only contend on shard locks
#[derive(Debug)]
pub struct LocalBucketStore {
    tokens: Tokens,
    interval: RefillInterval,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, LocalBucket>,
    lifecycle: Lifecycle,
}

impl LocalBucketStore {
    /// Create a store from `options`.
    pub fn new(options: LocalBucketStoreOptions) -> Self {
        Self {
            tokens: options.tokens,
            interval: options.interval,
            clock: options.clock,
            buckets: DashMap::new(),
            lifecycle: Lifecycle::new(),
        }
    } // end constructor

    /// Take one token from `key`'s bucket.
    pub fn take(&self, key: &str) -> Result<TakeResult, QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        let now = self.clock.now_nanos();
        let mut bucket = self.buckets.entry(key.to_string()).or_default();

        if bucket.is_expired(now) {
            *bucket = LocalBucket::default();
        }

        let evaluation = refill_and_take(
            &mut bucket.fields,
            now,
            *self.tokens,
            self.interval.as_nanos_u64(),
        );

        if let Some(seconds) = evaluation.expire_after_seconds {
            bucket.expire_after(now, seconds);
        }

        if !evaluation.result.allowed {
            tracing::debug!(key, reset_at = evaluation.result.reset_at, "take denied");
        }

        Ok(evaluation.result)
    } // end method take

    /// Read the stored capacity and token count of `key`, without refilling.
    /// Missing fields read as zero.
    pub fn get(&self, key: &str) -> Result<BucketSnapshot, QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        let now = self.clock.now_nanos();

        let snapshot = match self.buckets.get(key) {
            Some(bucket) if !bucket.is_expired(now) => BucketSnapshot {
                limit: bucket.fields.max_tokens.unwrap_or(0),
                remaining: bucket.fields.tokens.unwrap_or(0),
            },
            _ => BucketSnapshot::default(),
        };

        Ok(snapshot)
    } // end method get

    /// Overwrite `key`'s capacity and token count with `tokens`, and its
    /// interval with `interval`. The bucket then expires after one week unless
    /// used.
    ///
    /// `tokens` may be 0, which denies every `take` on the key until it is set
    /// again or expires.
    pub fn set(
        &self,
        key: &str,
        tokens: u64,
        interval: RefillInterval,
    ) -> Result<(), QuotaBucketError> {
        self.update_admin(key, |fields| {
            fields.tokens = Some(tokens);
            fields.max_tokens = Some(tokens);
            fields.interval = Some(interval.as_nanos_u64());
            Ok(())
        })
    } // end method set

    /// Add `tokens` to `key`'s current token count, possibly above capacity.
    ///
    /// Fails with [`QuotaBucketError::InvalidTokens`] when `tokens` exceeds
    /// `i64::MAX` or the stored count would, leaving the bucket untouched.
    pub fn burst(&self, key: &str, tokens: u64) -> Result<(), QuotaBucketError> {
        self.lifecycle.ensure_running()?;
        validate_burst_tokens(tokens)?;

        self.update_admin(key, |fields| {
            let current = fields.tokens.unwrap_or(0);
            match current.checked_add(tokens) {
                Some(total) if total <= MAX_BURST_TOKENS => {
                    fields.tokens = Some(total);
                    Ok(())
                }
                _ => Err(QuotaBucketError::InvalidTokens(format!(
                    "Burst would overflow the stored token count {current}"
                ))),
            }
        })
    } // end method burst

    fn update_admin(
        &self,
        key: &str,
        update: impl FnOnce(&mut BucketFields) -> Result<(), QuotaBucketError>,
    ) -> Result<(), QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        let now = self.clock.now_nanos();
        let mut bucket = self.buckets.entry(key.to_string()).or_default();

        if bucket.is_expired(now) {
            *bucket = LocalBucket::default();
        }

        update(&mut bucket.fields)?;
        bucket.expire_after(now, ADMIN_TTL_SECONDS);

        Ok(())
    }

    /// Stop the store and drop every bucket. Idempotent.
    pub fn close(&self) -> Result<(), QuotaBucketError> {
        if !self.lifecycle.stop() {
            return Ok(());
        }

        self.buckets.clear();
        tracing::debug!("local bucket store closed");

        Ok(())
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    /// Number of buckets held, expired or not.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are held.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Remove expired buckets, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_nanos();
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| !bucket.is_expired(now));

        before.saturating_sub(self.buckets.len())
    } // end method cleanup

    /// Run [`Self::cleanup`] every `every` on a background thread.
    ///
    /// The thread exits once the store is closed or dropped.
    pub fn run_cleanup_loop(self: &Arc<Self>, every: Duration) {
        let store: Weak<Self> = Arc::downgrade(self);

        thread::spawn(move || {
            loop {
                thread::sleep(every);

                let Some(store) = store.upgrade() else {
                    break;
                };

                if store.is_closed() {
                    break;
                }

                let removed = store.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "evicted expired local buckets");
                }
            }
        });
    } // end method run_cleanup_loop
}
