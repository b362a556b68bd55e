#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bucket;
mod clock;
mod common;
mod error;
mod lifecycle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use common::{BucketSnapshot, RefillInterval, TakeResult, Tokens};
pub use error::*;

pub mod local;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
pub mod redis;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
mod runtime;

#[cfg(test)]
mod tests;
