use std::{future::Future, time::Duration};

use crate::QuotaBucketError;

/// Run `fut` to completion, or fail with [`QuotaBucketError::Timeout`] once
/// `limit` elapses. `None` means no deadline.
///
/// The timed-out future is dropped, which aborts any in-flight round trip.
#[cfg(feature = "redis-tokio")]
pub(crate) async fn timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, QuotaBucketError>
where
    F: Future<Output = Result<T, QuotaBucketError>>,
{
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| QuotaBucketError::Timeout(limit))?,
    }
}

#[cfg(all(feature = "redis-smol", not(feature = "redis-tokio")))]
pub(crate) async fn timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, QuotaBucketError>
where
    F: Future<Output = Result<T, QuotaBucketError>>,
{
    use futures::future::{Either, select};

    match limit {
        None => fut.await,
        Some(limit) => {
            let fut = std::pin::pin!(fut);
            match select(fut, smol::Timer::after(limit)).await {
                Either::Left((result, _)) => result,
                Either::Right(_) => Err(QuotaBucketError::Timeout(limit)),
            }
        }
    }
}
