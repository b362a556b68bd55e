#![cfg(feature = "redis-tokio")]

use std::{env, sync::Arc, time::Duration};

use quotabucket::redis::{
    KeyPrefix, QuotaBucketRedisClient, RedisBucketStore, RedisBucketStoreOptions, RedisKey,
};
use quotabucket::{BucketSnapshot, ManualClock, QuotaBucketError, RefillInterval, Tokens};

const SECOND: u64 = 1_000_000_000;
const T0: u64 = 500_000 * SECOND;

fn redis_url() -> String {
    env::var("REDIS_URL")
        .expect("REDIS_URL must be set to run redis integration tests (try `make test-redis`)")
}

fn unique_prefix() -> KeyPrefix {
    let n: u64 = rand::random();
    KeyPrefix::try_from(format!("quotabucket_itest_{n}")).unwrap()
}

fn key(s: &str) -> RedisKey {
    RedisKey::try_from(s).unwrap()
}

async fn build_store(
    prefix: KeyPrefix,
    clock: Arc<ManualClock>,
    tokens: u64,
    interval_secs: u64,
) -> RedisBucketStore {
    let client = redis::Client::open(redis_url()).unwrap();
    let pool = QuotaBucketRedisClient::default_from_client(client)
        .await
        .unwrap();

    RedisBucketStore::new(RedisBucketStoreOptions {
        prefix: Some(prefix),
        tokens: Tokens::try_from(tokens).unwrap(),
        interval: RefillInterval::try_from(Duration::from_secs(interval_secs)).unwrap(),
        clock,
        ..RedisBucketStoreOptions::new(pool)
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a Redis server (run `make test-redis`)"]
async fn independent_stores_share_one_bucket() {
    let prefix = unique_prefix();
    let clock = Arc::new(ManualClock::new(T0));
    let capacity = 10u64;
    let callers = 4usize;

    // one store per caller, standing in for separate processes
    let mut stores = Vec::with_capacity(callers);
    for _ in 0..callers {
        let store = build_store(prefix.clone(), clock.clone(), capacity, 60).await;
        stores.push(Arc::new(store));
    }

    let handles: Vec<_> = stores
        .iter()
        .cloned()
        .map(|store| {
            tokio::spawn(async move {
                let k = key("shared");
                let mut allowed = 0u64;
                for _ in 0..capacity {
                    if store.take(&k).await.unwrap().allowed {
                        allowed += 1;
                    }
                }
                allowed
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        allowed += handle.await.unwrap();
    }

    assert_eq!(allowed, capacity);

    let last = stores[0].take(&key("shared")).await.unwrap();
    assert!(!last.allowed);
    assert_eq!(last.remaining, 0);
    assert_eq!(last.limit, capacity);
}

#[tokio::test]
#[ignore = "requires a Redis server (run `make test-redis`)"]
async fn refill_after_reset_at() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = build_store(unique_prefix(), clock.clone(), 2, 1).await;
    let k = key("k");

    store.take(&k).await.unwrap();
    let last = store.take(&k).await.unwrap();
    assert_eq!(last.remaining, 0);
    assert!(!store.take(&k).await.unwrap().allowed);

    clock.set(last.reset_at);

    let taken = store.take(&k).await.unwrap();
    assert!(taken.allowed);
    assert_eq!(taken.remaining, 1);
}

#[tokio::test]
#[ignore = "requires a Redis server (run `make test-redis`)"]
async fn admin_writes_are_visible_to_other_stores() {
    let prefix = unique_prefix();
    let clock = Arc::new(ManualClock::new(T0));
    let admin = build_store(prefix.clone(), clock.clone(), 1, 1).await;
    let worker = build_store(prefix, clock, 1, 1).await;
    let k = key("tenant:42");

    let interval = RefillInterval::try_from(Duration::from_secs(30)).unwrap();
    admin.set(&k, 3, interval).await.unwrap();

    let taken = worker.take(&k).await.unwrap();
    assert_eq!(taken.limit, 3);
    assert_eq!(taken.remaining, 2);

    admin.burst(&k, 5).await.unwrap();
    assert_eq!(
        worker.get(&k).await.unwrap(),
        BucketSnapshot {
            limit: 3,
            remaining: 7
        }
    );
}

#[tokio::test]
#[ignore = "requires a Redis server (run `make test-redis`)"]
async fn closing_one_store_leaves_others_running() {
    let prefix = unique_prefix();
    let clock = Arc::new(ManualClock::new(T0));
    let a = build_store(prefix.clone(), clock.clone(), 5, 1).await;
    let b = build_store(prefix, clock, 5, 1).await;

    a.close().await.unwrap();

    let closed = a.take(&key("k")).await;
    assert!(matches!(closed, Err(QuotaBucketError::Stopped)));
    assert!(b.take(&key("k")).await.unwrap().allowed);
}
