use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    BucketSnapshot, ManualClock, QuotaBucketError, RefillInterval, Tokens,
    local::{LocalBucketStore, LocalBucketStoreOptions},
};

const SECOND: u64 = 1_000_000_000;
const T0: u64 = 1_000 * SECOND;

fn store(tokens: u64, interval: Duration) -> (LocalBucketStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = LocalBucketStore::new(LocalBucketStoreOptions {
        tokens: Tokens::try_from(tokens).unwrap(),
        interval: RefillInterval::try_from(interval).unwrap(),
        clock: clock.clone(),
    });

    (store, clock)
}

#[test]
fn first_take_on_unknown_key_is_allowed() {
    let (store, _clock) = store(5, Duration::from_secs(1));

    let taken = store.take("k").unwrap();

    assert!(taken.allowed);
    assert_eq!(taken.limit, 5);
    assert_eq!(taken.remaining, 4);
    assert_eq!(taken.reset_at, T0 + SECOND);
}

#[test]
fn rejects_after_capacity_within_interval() {
    let (store, _clock) = store(3, Duration::from_secs(1));

    for expected in (0..3).rev() {
        let taken = store.take("k").unwrap();
        assert!(taken.allowed);
        assert_eq!(taken.remaining, expected);
    }

    let taken = store.take("k").unwrap();
    assert!(!taken.allowed);
    assert_eq!(taken.remaining, 0);
    assert_eq!(taken.limit, 3);
}

#[test]
fn fifteen_per_minute_example() {
    let (store, clock) = store(15, Duration::from_secs(60));

    for _ in 0..15 {
        assert!(store.take("k").unwrap().allowed);
    }

    let denied = store.take("k").unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);

    clock.advance(Duration::from_secs(61));

    let taken = store.take("k").unwrap();
    assert!(taken.allowed);
    assert_eq!(taken.remaining, 14);
}

#[test]
fn per_key_state_is_independent() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    assert!(store.take("a").unwrap().allowed);
    assert!(!store.take("a").unwrap().allowed);
    assert!(store.take("b").unwrap().allowed);
}

#[test]
fn get_on_unknown_key_is_zero() {
    let (store, _clock) = store(5, Duration::from_secs(1));

    assert_eq!(store.get("missing").unwrap(), BucketSnapshot::default());
}

#[test]
fn get_reads_raw_fields_without_defaults() {
    let (store, _clock) = store(5, Duration::from_secs(1));

    store.take("k").unwrap();

    // capacity is not stored until a refill or set
    assert_eq!(
        store.get("k").unwrap(),
        BucketSnapshot {
            limit: 0,
            remaining: 4
        }
    );
}

#[test]
fn set_then_get_returns_configured_values() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    let interval = RefillInterval::try_from(Duration::from_secs(1)).unwrap();
    store.set("k", 10, interval).unwrap();

    assert_eq!(
        store.get("k").unwrap(),
        BucketSnapshot {
            limit: 10,
            remaining: 10
        }
    );
}

#[test]
fn set_overrides_defaults_for_take() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    let interval = RefillInterval::try_from(Duration::from_secs(10)).unwrap();
    store.set("k", 5, interval).unwrap();

    let taken = store.take("k").unwrap();
    assert!(taken.allowed);
    assert_eq!(taken.limit, 5);
    assert_eq!(taken.remaining, 4);
    assert_eq!(taken.reset_at, T0 + 10 * SECOND);
}

#[test]
fn burst_exceeds_capacity_until_next_refill() {
    let (store, clock) = store(1, Duration::from_secs(1));

    let interval = RefillInterval::try_from(Duration::from_secs(1)).unwrap();
    store.set("k", 10, interval).unwrap();
    assert_eq!(store.take("k").unwrap().remaining, 9);

    store.burst("k", 5).unwrap();
    assert_eq!(
        store.get("k").unwrap(),
        BucketSnapshot {
            limit: 10,
            remaining: 14
        }
    );

    clock.advance(Duration::from_secs(1));

    let taken = store.take("k").unwrap();
    assert!(taken.allowed);
    assert_eq!(taken.remaining, 9);
}

#[test]
fn burst_on_unknown_key_creates_tokens() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    store.burst("k", 3).unwrap();

    assert_eq!(
        store.get("k").unwrap(),
        BucketSnapshot {
            limit: 0,
            remaining: 3
        }
    );
}

#[test]
fn bucket_expires_three_intervals_after_last_take() {
    let (store, clock) = store(2, Duration::from_secs(1));

    store.take("k").unwrap();
    store.take("k").unwrap();
    assert!(!store.take("k").unwrap().allowed);

    clock.advance(Duration::from_secs(3));

    assert_eq!(store.get("k").unwrap(), BucketSnapshot::default());

    let taken = store.take("k").unwrap();
    assert!(taken.allowed);
    assert_eq!(taken.remaining, 1);
    assert_eq!(taken.reset_at, T0 + 4 * SECOND);
}

#[test]
fn set_keeps_bucket_for_a_week() {
    let (store, clock) = store(1, Duration::from_secs(1));

    let interval = RefillInterval::try_from(Duration::from_secs(1)).unwrap();
    store.set("k", 4, interval).unwrap();

    clock.advance(Duration::from_secs(60 * 60 * 24 * 7 - 1));
    assert_eq!(store.get("k").unwrap().limit, 4);

    clock.advance(Duration::from_secs(1));
    assert_eq!(store.get("k").unwrap(), BucketSnapshot::default());
}

#[test]
fn concurrent_takes_allow_exactly_capacity() {
    let capacity = 25u64;
    let callers = 8u64;
    let (store, _clock) = store(capacity, Duration::from_secs(60));
    let store = Arc::new(store);
    let allowed = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let store = store.clone();
            let allowed = allowed.clone();
            thread::spawn(move || {
                for _ in 0..capacity {
                    if store.take("hot").unwrap().allowed {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(allowed.load(Ordering::SeqCst), capacity);
}

#[test]
fn close_is_idempotent_and_stops_operations() {
    let (store, _clock) = store(1, Duration::from_secs(1));
    store.take("k").unwrap();

    assert!(store.close().is_ok());
    assert!(store.close().is_ok());
    assert!(store.is_closed());
    assert!(store.is_empty());

    let interval = RefillInterval::default();
    assert!(matches!(store.take("k"), Err(QuotaBucketError::Stopped)));
    assert!(matches!(store.get("k"), Err(QuotaBucketError::Stopped)));
    assert!(matches!(store.set("k", 1, interval), Err(QuotaBucketError::Stopped)));
    assert!(matches!(store.burst("k", 1), Err(QuotaBucketError::Stopped)));
}

#[test]
fn cleanup_removes_only_expired_buckets() {
    let (store, clock) = store(1, Duration::from_secs(1));

    store.take("short").unwrap();
    store.set("long", 1, RefillInterval::default()).unwrap();
    assert_eq!(store.len(), 2);

    clock.advance(Duration::from_secs(10));

    assert_eq!(store.cleanup(), 1);
    assert_eq!(store.len(), 1);
    assert_eq!(store.get("long").unwrap().limit, 1);
}

#[test]
fn cleanup_loop_evicts_in_background() {
    let (store, clock) = store(1, Duration::from_secs(1));
    let store = Arc::new(store);

    store.take("k1").unwrap();
    store.take("k2").unwrap();
    assert_eq!(store.len(), 2);

    store.run_cleanup_loop(Duration::from_millis(10));
    clock.advance(Duration::from_secs(5));

    let mut remaining = store.len();
    for _ in 0..200 {
        if remaining == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        remaining = store.len();
    }

    assert_eq!(remaining, 0);
    store.close().unwrap();
}

#[test]
fn set_to_zero_tokens_denies_every_take() {
    let (store, clock) = store(5, Duration::from_secs(1));

    store.set("k", 0, RefillInterval::default()).unwrap();

    for _ in 0..3 {
        let taken = store.take("k").unwrap();
        assert!(!taken.allowed);
        assert_eq!(taken.limit, 0);
        assert_eq!(taken.remaining, 0);

        clock.advance(Duration::from_secs(2));
    }

    assert_eq!(
        store.get("k").unwrap(),
        BucketSnapshot {
            limit: 0,
            remaining: 0
        }
    );
}

#[test]
fn burst_above_i64_max_is_rejected() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    assert!(matches!(
        store.burst("k", i64::MAX as u64 + 1),
        Err(QuotaBucketError::InvalidTokens(_))
    ));
    assert!(store.is_empty());

    store.burst("k", i64::MAX as u64).unwrap();
    assert_eq!(store.get("k").unwrap().remaining, i64::MAX as u64);
}

#[test]
fn burst_overflowing_stored_count_leaves_bucket_untouched() {
    let (store, _clock) = store(1, Duration::from_secs(1));

    store.burst("k", i64::MAX as u64 - 1).unwrap();

    assert!(matches!(store.burst("k", 2), Err(QuotaBucketError::InvalidTokens(_))));
    assert_eq!(store.get("k").unwrap().remaining, i64::MAX as u64 - 1);
}
