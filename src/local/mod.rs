//! In-process provider.
//!
//! The local provider keeps buckets in a [`DashMap`](dashmap::DashMap) inside
//! the current process and evaluates the same refill-and-take procedure as the
//! Redis script, including its expiries.
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** each decision holds the key's map entry for its duration
//! - **No I/O:** no network or external store required
//! - **Process-scoped:** state is not shared across processes
//!
//! # When to Use
//!
//! ✅ **Use local provider when:**
//! - Single-process application
//! - Tests and simulations (pair with [`ManualClock`](crate::ManualClock))
//!
//! ❌ **Don't use local provider when:**
//! - Multiple application instances need shared quotas
//! - Quotas must survive process restarts
//!
//! # Examples
//!
//! ```
//! use quotabucket::{Tokens, local::{LocalBucketStore, LocalBucketStoreOptions}};
//!
//! let store = LocalBucketStore::new(LocalBucketStoreOptions {
//!     tokens: Tokens::try_from(2u64).unwrap(),
//!     ..Default::default()
//! });
//!
//! assert!(store.take("user_123").unwrap().allowed);
//! assert!(store.take("user_123").unwrap().allowed);
//! assert!(!store.take("user_123").unwrap().allowed);
//! ```

mod local_bucket_store;
pub use local_bucket_store::*;
