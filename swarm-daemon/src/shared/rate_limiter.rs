//! Upload rate limiting shared by all transfers
//!
//! One token bucket caps the combined upload rate. Peer connections ask for
//! permission to send through [`RateLimiter::try_consume`], which grants
//! immediately or says how long to wait. Each running transfer holds a
//! [`RateRegistration`] for its bookkeeping; closing the transfer drops it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use swarm_common::InfoHash;

const BYTES_PER_KIB: f64 = 1024.0;

/// Token bucket measured in bytes
#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes per second; infinite means unlimited
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `amount` tokens, going into debt if necessary
    ///
    /// Returns how long until the debt is repaid.
    pub fn consume(&mut self, amount: f64, now: Instant) -> Duration {
        if self.rate.is_infinite() {
            return Duration::ZERO;
        }
        self.refill(now);
        self.tokens -= amount;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    pub fn set_rate(&mut self, rate: f64, capacity: f64) {
        self.refill(Instant::now());
        self.rate = rate;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

struct LimiterState {
    bucket: TokenBucket,
    max_rate_kib: u64,
    unit_size: usize,
}

/// Bytes sent per registered transfer
type Sent = Arc<Mutex<HashMap<InfoHash, u64>>>;

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    sent: Sent,
}

/// Bucket parameters for a KiB/s limit (0 = unlimited)
fn bucket_params(max_rate_kib: u64, unit_size: usize) -> (f64, f64) {
    if max_rate_kib == 0 {
        return (f64::INFINITY, f64::INFINITY);
    }
    let rate = max_rate_kib as f64 * BYTES_PER_KIB;
    // One second of burst, but never less than a single send unit
    (rate, rate.max(unit_size as f64))
}

impl RateLimiter {
    pub fn new(max_rate_kib: u64, unit_size: usize) -> Self {
        let (rate, capacity) = bucket_params(max_rate_kib, unit_size);
        Self {
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(rate, capacity),
                max_rate_kib,
                unit_size,
            }),
            sent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Change the combined upload limit in KiB/s (0 = unlimited)
    pub fn set_rate(&self, max_rate_kib: u64) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let (rate, capacity) = bucket_params(max_rate_kib, state.unit_size);
        state.bucket.set_rate(rate, capacity);
        state.max_rate_kib = max_rate_kib;
    }

    pub fn set_unit_size(&self, unit_size: usize) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let (rate, capacity) = bucket_params(state.max_rate_kib, unit_size);
        state.bucket.set_rate(rate, capacity);
        state.unit_size = unit_size;
    }

    pub fn max_rate_kib(&self) -> u64 {
        self.state.lock().expect("rate limiter lock poisoned").max_rate_kib
    }

    pub fn unit_size(&self) -> usize {
        self.state.lock().expect("rate limiter lock poisoned").unit_size
    }

    /// Ask to send `bytes`
    ///
    /// # Returns
    /// How long the caller should wait before sending; zero to send now
    pub fn try_consume(&self, bytes: usize) -> Duration {
        self.state
            .lock()
            .expect("rate limiter lock poisoned")
            .bucket
            .consume(bytes as f64, Instant::now())
    }

    /// Start bookkeeping for a transfer
    pub fn register(&self, info_hash: InfoHash) -> RateRegistration {
        self.sent
            .lock()
            .expect("rate limiter lock poisoned")
            .insert(info_hash, 0);
        RateRegistration {
            info_hash,
            sent: self.sent.clone(),
        }
    }

    pub fn registered(&self) -> usize {
        self.sent.lock().expect("rate limiter lock poisoned").len()
    }
}

/// A transfer's slot in the limiter's bookkeeping
pub struct RateRegistration {
    info_hash: InfoHash,
    sent: Sent,
}

impl RateRegistration {
    pub fn record_sent(&self, bytes: u64) {
        if let Some(total) = self
            .sent
            .lock()
            .expect("rate limiter lock poisoned")
            .get_mut(&self.info_hash)
        {
            *total += bytes;
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.sent
            .lock()
            .expect("rate limiter lock poisoned")
            .get(&self.info_hash)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for RateRegistration {
    fn drop(&mut self) {
        self.sent
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(&self.info_hash);
    }
}
