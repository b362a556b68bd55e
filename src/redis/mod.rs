//! Redis-backed provider.
//!
//! Buckets live in Redis hashes shared by every process that points at the same
//! server. The refill-and-take decision runs server-side as a Lua script, so
//! concurrent callers on the same key are serialized by Redis itself; there is
//! no client-side locking and no local state.
//!
//! # Data model
//!
//! One hash per key (`<prefix>:<key>`, or the raw key without a prefix):
//!
//! | field | meaning |
//! |-------|---------|
//! | `s`   | Unix nanoseconds of the first write |
//! | `t`   | last refill period processed |
//! | `i`   | refill period in nanoseconds |
//! | `k`   | tokens available |
//! | `m`   | capacity |
//!
//! Hashes are never deleted explicitly; they expire 30 seconds after a
//! half-finished first write, three intervals after the last `take`, or one
//! week after `set`/`burst`.

mod common;
pub use common::{KeyPrefix, QuotaBucketRedisClient, RedisKey};

pub(crate) use common::RedisKeyGenerator;

mod redis_bucket_store;
pub use redis_bucket_store::{RedisBucketStore, RedisBucketStoreOptions};

pub(crate) use redis_bucket_store::decode_field_lenient;

pub(crate) mod take_script;
