use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;

use quotabucket::local::{LocalBucketStore, LocalBucketStoreOptions};
use quotabucket::{RefillInterval, TakeResult, Tokens};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Provider {
    Local,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "quotabucket-stress",
    about = "Load test / correctness harness for quotabucket"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Local)]
    provider: Provider,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    /// Concurrent callers.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 10)]
    duration_s: u64,

    /// Bucket capacity.
    #[arg(long, default_value_t = 1000)]
    tokens: u64,

    /// Refill interval.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, default_value_t = 10000)]
    key_space: usize,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    #[arg(long, default_value = "redis://127.0.0.1:16379/")]
    redis_url: String,

    #[arg(long, default_value = "stress")]
    redis_prefix: String,

    /// Redis connection managers in the pool.
    #[arg(long, default_value_t = 4)]
    connections: usize,
}

#[derive(Default)]
struct Counts {
    allowed: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

impl Counts {
    fn record<E>(&self, res: Result<TakeResult, E>) {
        match res {
            Ok(TakeResult { allowed: true, .. }) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn build_keys(args: &Args) -> Vec<String> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        _ => args.key_space.max(1),
    };
    (0..n).map(|i| format!("user_{i}")).collect()
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn xorshift(seed: &mut u64) -> u64 {
    // xorshift64*
    *seed ^= *seed >> 12;
    *seed ^= *seed << 25;
    *seed ^= *seed >> 27;
    *seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
    *seed
}

fn pick_key(args: &Args, key_count: usize, seed: &mut u64) -> usize {
    match args.key_dist {
        KeyDist::Hot => 0,
        KeyDist::Uniform => (xorshift(seed) as usize) % key_count,
        KeyDist::Skewed => {
            let r = (xorshift(seed) % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                0
            } else {
                let tail = key_count.saturating_sub(1).max(1);
                (1 + (xorshift(seed) as usize) % tail) % key_count
            }
        }
    }
}

fn tokens(args: &Args) -> Tokens {
    Tokens::try_from(args.tokens).unwrap()
}

fn interval(args: &Args) -> RefillInterval {
    RefillInterval::try_from(Duration::from_millis(args.interval_ms)).unwrap()
}

fn print_results(args: &Args, elapsed: Duration, hist: &Histogram<u64>, counts: &Counts) {
    let allowed = counts.allowed.load(Ordering::Relaxed);
    let denied = counts.denied.load(Ordering::Relaxed);
    let errors = counts.errors.load(Ordering::Relaxed);
    let ops = allowed + denied + errors;

    println!(
        "provider={:?} key_dist={:?} threads={} tokens={} interval_ms={}",
        args.provider, args.key_dist, args.threads, args.tokens, args.interval_ms
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!("allowed={allowed} denied={denied} errors={errors}");

    if matches!(args.key_dist, KeyDist::Hot) {
        // one full bucket per interval window touched
        let windows = elapsed.as_millis() as u64 / args.interval_ms.max(1) + 2;
        let bound = windows.saturating_mul(args.tokens);
        println!(
            "allowed_bound={bound} within_bound={}",
            if allowed <= bound { "yes" } else { "NO" }
        );
    }

    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }
}

fn run_local(args: &Args) {
    let keys = build_keys(args);
    let store = Arc::new(LocalBucketStore::new(LocalBucketStoreOptions {
        tokens: tokens(args),
        interval: interval(args),
        ..Default::default()
    }));
    store.run_cleanup_loop(Duration::from_secs(1));

    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::default());
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let store = Arc::clone(&store);
        let keys = keys.clone();
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let args = args.clone();

        handles.push(std::thread::spawn(move || {
            let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
            let mut seed = (t as u64 + 1) * 0x9E37_79B9_7F4A_7C15;
            let mut i = 0_u64;

            while !stop.load(Ordering::Relaxed) {
                i = i.wrapping_add(1);
                let k = &keys[pick_key(&args, keys.len(), &mut seed)];
                let t0 = should_sample(i, args.sample_every).then(Instant::now);

                let res = store.take(k);

                if let Some(t0) = t0 {
                    let _ = hist.record((t0.elapsed().as_micros() as u64).max(1));
                }
                counts.record(res);
            }

            hist
        }));
    }

    std::thread::sleep(Duration::from_secs(args.duration_s));
    stop.store(true, Ordering::Relaxed);

    let mut merged = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    for h in handles {
        merged.add(&h.join().unwrap()).unwrap();
    }

    let _ = store.close();
    print_results(args, started.elapsed(), &merged, &counts);
}

#[cfg(feature = "redis-tokio")]
fn run_redis(args: &Args) {
    use quotabucket::redis::{
        KeyPrefix, QuotaBucketRedisClient, RedisBucketStore, RedisBucketStoreOptions, RedisKey,
    };

    let args = args.clone();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .build()
        .unwrap();

    rt.block_on(async move {
        let client = redis::Client::open(args.redis_url.as_str()).unwrap();
        let pool = QuotaBucketRedisClient::from_client(client, args.connections)
            .await
            .unwrap();

        let store = Arc::new(RedisBucketStore::new(RedisBucketStoreOptions {
            prefix: Some(KeyPrefix::try_from(args.redis_prefix.clone()).unwrap()),
            tokens: tokens(&args),
            interval: interval(&args),
            ..RedisBucketStoreOptions::new(pool)
        }));

        let keys: Vec<RedisKey> = build_keys(&args)
            .into_iter()
            .map(|k| RedisKey::try_from(k).unwrap())
            .collect();
        let keys = Arc::new(keys);

        let stop = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Counts::default());
        let started = Instant::now();

        let mut join = Vec::with_capacity(args.threads);
        for t in 0..args.threads {
            let store = Arc::clone(&store);
            let keys = Arc::clone(&keys);
            let stop = Arc::clone(&stop);
            let counts = Arc::clone(&counts);
            let args = args.clone();

            join.push(tokio::spawn(async move {
                let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
                let mut seed = (t as u64 + 1) * 0xD134_2543_DE82_EF95;
                let mut i = 0_u64;

                while !stop.load(Ordering::Relaxed) {
                    i = i.wrapping_add(1);
                    let k = &keys[pick_key(&args, keys.len(), &mut seed)];
                    let t0 = should_sample(i, args.sample_every).then(Instant::now);

                    let res = store.take(k).await;

                    if let Some(t0) = t0 {
                        let _ = hist.record((t0.elapsed().as_micros() as u64).max(1));
                    }
                    counts.record(res);
                }

                hist
            }));
        }

        tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
        stop.store(true, Ordering::Relaxed);

        let mut merged = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
        for j in join {
            merged.add(&j.await.unwrap()).unwrap();
        }

        let _ = store.close().await;
        print_results(&args, started.elapsed(), &merged, &counts);
    });
}

#[cfg(not(feature = "redis-tokio"))]
fn run_redis(_: &Args) {
    eprintln!(
        "redis provider requires: cargo run -p quotabucket-stress --features redis-tokio -- ..."
    );
    std::process::exit(2);
}

fn main() {
    let args = Args::parse();
    match args.provider {
        Provider::Local => run_local(&args),
        Provider::Redis => run_redis(&args),
    }
}
