//! Token-bucket rate limiting for outbound API calls.
//!
//! One bucket per key plus a shared global bucket; a call is admitted only
//! when both have a token. `allow` is the non-blocking probe, `acquire` the
//! awaitable form used inside the ingest workers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(burst: f64) -> Self {
        Self { tokens: burst, last: Instant::now() }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last = now;
    }
}

pub struct RateLimiter {
    rate: f64,
    burst: f64,
    global: Mutex<Bucket>,
    per_key: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            global: Mutex::new(Bucket::new(burst)),
            per_key: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the key's bucket and the global bucket, or neither.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();

        let mut global = self.global.lock().unwrap();
        global.refill(self.rate, self.burst, now);
        if global.tokens < 1.0 {
            return false;
        }

        let mut map = self.per_key.lock().unwrap();
        let bucket = map.entry(key.to_string()).or_insert_with(|| Bucket::new(self.burst));
        bucket.refill(self.rate, self.burst, now);
        if bucket.tokens < 1.0 {
            return false;
        }

        global.tokens -= 1.0;
        bucket.tokens -= 1.0;
        true
    }

    /// Await admission; polls at the bucket's natural refill cadence.
    pub async fn acquire(&self, key: &str) {
        loop {
            if self.allow(key) {
                return;
            }
            let wait = Duration::from_secs_f64((1.0 / self.rate).min(0.25));
            tokio::time::sleep(wait).await;
        }
    }
}
