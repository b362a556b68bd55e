use std::{sync::Arc, time::Duration};

use redis::Value;

use crate::{
    BucketSnapshot, Clock, QuotaBucketError, RefillInterval, SystemClock, TakeResult, Tokens,
    common::{ADMIN_TTL_SECONDS, validate_burst_tokens},
    lifecycle::Lifecycle,
    redis::{
        KeyPrefix, QuotaBucketRedisClient, RedisKey, RedisKeyGenerator, common::PooledConnection,
        take_script::TakeScriptProxy,
    },
    runtime,
};

const FIELD_INTERVAL: &str = "i";
const FIELD_MAX_TOKENS: &str = "m";
const FIELD_TOKENS: &str = "k";

/// Configuration for [`RedisBucketStore`].
///
/// # Requirements
///
/// - **Redis version:** any version with `EVALSHA` and multi-field `HSET` (>= 4.0)
/// - **Runtime:** Tokio or Smol (via `redis-tokio` or `redis-smol` features)
///
/// # Examples
///
/// ```ignore
/// use quotabucket::redis::{QuotaBucketRedisClient, RedisBucketStoreOptions};
/// use quotabucket::{RefillInterval, Tokens};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let client = QuotaBucketRedisClient::default_from_client(client).await?;
///
/// let options = RedisBucketStoreOptions {
///     tokens: Tokens::try_from(15u64)?,
///     interval: RefillInterval::try_from(Duration::from_secs(60))?,
///     ..RedisBucketStoreOptions::new(client)
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RedisBucketStoreOptions {
    /// Connection pool.
    pub client: QuotaBucketRedisClient,

    /// Optional namespace for stored keys.
    ///
    /// With a prefix buckets live at `<prefix>:<key>`; without one the caller key
    /// is used verbatim.
    pub prefix: Option<KeyPrefix>,

    /// Capacity for keys without a stored override.
    pub tokens: Tokens,

    /// Refill interval for keys without a stored override.
    pub interval: RefillInterval,

    /// Deadline for each operation, covering every round trip it makes.
    pub operation_timeout: Option<Duration>,

    /// `PING` each leased connection before use, failing with
    /// [`QuotaBucketError::ConnectionUnavailable`] if it does not answer.
    pub health_check: bool,

    /// Source of the `now` passed to the take procedure.
    pub clock: Arc<dyn Clock>,
}

impl RedisBucketStoreOptions {
    /// Options with default capacity (1), interval (1s), no prefix, no deadline
    /// and no health check.
    pub fn new(client: QuotaBucketRedisClient) -> Self {
        Self {
            client,
            prefix: None,
            tokens: Tokens::default(),
            interval: RefillInterval::default(),
            operation_timeout: None,
            health_check: false,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Token-bucket store backed by Redis.
///
/// Enables quota tracking across processes and machines using Redis as the only
/// coordination point. The decision path (`take`) is one atomic Lua script;
/// `get`, `set` and `burst` are plain hash commands.
///
/// # Consistency Semantics
///
/// - **Per-key atomicity:** each `take` is a single script execution
/// - **No cross-key ordering:** requests on different keys are independent
/// - **Administrative writes:** `set` and `burst` are two round trips and not
///   atomic with each other (see [`RedisBucketStore::set`])
///
/// # Examples
///
/// ```ignore
/// let store = RedisBucketStore::new(options);
/// let key = RedisKey::try_from("user_123")?;
///
/// let taken = store.take(&key).await?;
/// if !taken.allowed {
///     /* send 429, retry at taken.reset_at */
/// }
/// ```
#[derive(Debug)]
pub struct RedisBucketStore {
    client: QuotaBucketRedisClient,
    key_generator: RedisKeyGenerator,
    take_proxy: TakeScriptProxy,
    tokens: Tokens,
    interval: RefillInterval,
    operation_timeout: Option<Duration>,
    health_check: bool,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
}

impl RedisBucketStore {
    /// Create a store from `options`.
    pub fn new(options: RedisBucketStoreOptions) -> Self {
        Self {
            client: options.client,
            key_generator: RedisKeyGenerator::new(options.prefix),
            take_proxy: TakeScriptProxy::new(),
            tokens: options.tokens,
            interval: options.interval,
            operation_timeout: options.operation_timeout,
            health_check: options.health_check,
            clock: options.clock,
            lifecycle: Lifecycle::new(),
        }
    } // end constructor

    /// The connection pool this store uses.
    pub fn client(&self) -> &QuotaBucketRedisClient {
        &self.client
    }

    /// Take one token from `key`'s bucket.
    ///
    /// The bucket is created full on first use and refilled for every interval
    /// boundary crossed since. `limit`, `remaining` and `reset_at` are reported
    /// whether or not a token was taken.
    pub async fn take(&self, key: &RedisKey) -> Result<TakeResult, QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        // time of the call, not of the round trip
        let now = self.clock.now_nanos();
        let bucket_key = self.key_generator.get_bucket_key(key);

        let result = runtime::timeout(self.operation_timeout, async {
            let mut connection = self.acquire().await?;
            self.take_proxy
                .take(
                    &mut *connection,
                    &bucket_key,
                    now,
                    *self.tokens,
                    self.interval.as_nanos_u64(),
                )
                .await
        })
        .await?;

        if !result.allowed {
            tracing::debug!(key = %key, reset_at = result.reset_at, "take denied");
        }

        Ok(result)
    } // end method take

    /// Read the stored capacity and token count of `key`.
    ///
    /// No refill is computed, so `remaining` may be stale relative to elapsed
    /// intervals. Missing fields read as zero. A field that is present but not a
    /// non-negative integer also reads as zero; this is logged, not returned.
    pub async fn get(&self, key: &RedisKey) -> Result<BucketSnapshot, QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        let bucket_key = self.key_generator.get_bucket_key(key);

        let reply: Vec<Value> = runtime::timeout(self.operation_timeout, async {
            let mut connection = self.acquire().await?;
            redis::cmd("HMGET")
                .arg(&bucket_key)
                .arg(FIELD_MAX_TOKENS)
                .arg(FIELD_TOKENS)
                .query_async(&mut *connection)
                .await
                .map_err(|err| QuotaBucketError::from_redis("failed to get key", err))
        })
        .await?;

        if reply.len() != 2 {
            return Err(QuotaBucketError::MalformedResponse(format!(
                "not enough keys returned, expected 2 got {}",
                reply.len()
            )));
        }

        Ok(BucketSnapshot {
            limit: decode_field_lenient(key, FIELD_MAX_TOKENS, &reply[0]),
            remaining: decode_field_lenient(key, FIELD_TOKENS, &reply[1]),
        })
    } // end method get

    /// Overwrite `key`'s capacity and token count with `tokens`, and its
    /// interval with `interval`. The bucket then expires after one week unless
    /// used.
    ///
    /// Unlike the store-wide default, `tokens` may be 0: the key then denies
    /// every `take` until it is set again or expires.
    ///
    /// This is two round trips: the field write, then the expiry. If the second
    /// fails, the fields are written but the key keeps its previous expiry (or
    /// none, for a new key) and the error is returned.
    pub async fn set(
        &self,
        key: &RedisKey,
        tokens: u64,
        interval: RefillInterval,
    ) -> Result<(), QuotaBucketError> {
        self.lifecycle.ensure_running()?;

        let bucket_key = self.key_generator.get_bucket_key(key);

        runtime::timeout(self.operation_timeout, async {
            let mut connection = self.acquire().await?;

            redis::cmd("HSET")
                .arg(&bucket_key)
                .arg(FIELD_TOKENS)
                .arg(tokens)
                .arg(FIELD_MAX_TOKENS)
                .arg(tokens)
                .arg(FIELD_INTERVAL)
                .arg(interval.as_nanos_u64())
                .query_async::<()>(&mut *connection)
                .await
                .map_err(|err| QuotaBucketError::from_redis("failed to set key", err))?;

            Self::expire_admin(&mut connection, &bucket_key).await
        })
        .await
    } // end method set

    /// Add `tokens` to `key`'s current token count.
    ///
    /// Capacity and interval are untouched, so the count may exceed capacity
    /// until the next `take` clamps it during refill. Refreshes the one-week
    /// expiry.
    ///
    /// `tokens` above `i64::MAX` fail with [`QuotaBucketError::InvalidTokens`]
    /// before Redis is contacted. An increment that would overflow the stored
    /// counter is rejected by Redis and surfaces as
    /// [`QuotaBucketError::ProcedureExecutionFailed`].
    pub async fn burst(&self, key: &RedisKey, tokens: u64) -> Result<(), QuotaBucketError> {
        self.lifecycle.ensure_running()?;
        validate_burst_tokens(tokens)?;

        let bucket_key = self.key_generator.get_bucket_key(key);

        runtime::timeout(self.operation_timeout, async {
            let mut connection = self.acquire().await?;

            redis::cmd("HINCRBY")
                .arg(&bucket_key)
                .arg(FIELD_TOKENS)
                .arg(tokens)
                .query_async::<()>(&mut *connection)
                .await
                .map_err(|err| QuotaBucketError::from_redis("failed to burst key", err))?;

            Self::expire_admin(&mut connection, &bucket_key).await
        })
        .await
    } // end method burst

    /// Stop the store and close its connection pool.
    ///
    /// Only the first call tears anything down; later calls return `Ok(())`
    /// without contacting Redis. Every other operation fails with
    /// [`QuotaBucketError::Stopped`] afterwards.
    pub async fn close(&self) -> Result<(), QuotaBucketError> {
        if !self.lifecycle.stop() {
            return Ok(());
        }

        self.client.close();
        tracing::debug!("redis bucket store closed");

        Ok(())
    } // end method close

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    async fn acquire(&self) -> Result<PooledConnection, QuotaBucketError> {
        let mut connection = self.client.acquire()?;

        if self.health_check {
            redis::cmd("PING")
                .query_async::<()>(&mut *connection)
                .await
                .map_err(|source| QuotaBucketError::ConnectionUnavailable {
                    context: "health check failed",
                    source,
                })?;
        }

        Ok(connection)
    }

    async fn expire_admin(
        connection: &mut PooledConnection,
        bucket_key: &str,
    ) -> Result<(), QuotaBucketError> {
        redis::cmd("EXPIRE")
            .arg(bucket_key)
            .arg(ADMIN_TTL_SECONDS)
            .query_async::<()>(&mut **connection)
            .await
            .map_err(|err| QuotaBucketError::from_redis("failed to set expire on key", err))
    }
}

/// Best-effort decode of a stored counter: absent or unparsable reads as zero.
pub(crate) fn decode_field_lenient(key: &RedisKey, field: &str, value: &Value) -> u64 {
    match value {
        Value::Nil => 0,
        Value::Int(n) => u64::try_from(*n).unwrap_or_else(|_| {
            tracing::warn!(key = %key, field, value = n, "stored field is negative, reading as 0");
            0
        }),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(|| {
                tracing::warn!(key = %key, field, "stored field is not an integer, reading as 0");
                0
            }),
        other => {
            tracing::warn!(
                key = %key,
                field,
                value = ?other,
                "unexpected field type, reading as 0"
            );
            0
        }
    }
}
