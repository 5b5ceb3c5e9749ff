use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

// Token-bucket per remote address. Loopback gets a generous allowance so
// the local dashboard and CLI are never throttled by their own daemon.

const REMOTE_PER_MINUTE: f64 = 60.0;
const LOOPBACK_PER_MINUTE: f64 = 600.0;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn allowance(addr: IpAddr) -> f64 {
        if addr.is_loopback() {
            LOOPBACK_PER_MINUTE
        } else {
            REMOTE_PER_MINUTE
        }
    }

    /// Take one token. Returns `Err(retry_after_seconds)` when exhausted.
    pub fn check(&self, addr: IpAddr) -> Result<(), u64> {
        let per_minute = Self::allowance(addr);
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let bucket = buckets.entry(addr).or_insert_with(|| Bucket {
            tokens: per_minute,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_minute / 60.0).min(per_minute);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err((deficit * 60.0 / per_minute).ceil() as u64)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_address_exhausts() {
        let limiter = RateLimiter::new();
        let addr: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..60 {
            assert!(limiter.check(addr).is_ok());
        }
        let retry = limiter.check(addr).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn loopback_gets_looser_allowance() {
        let limiter = RateLimiter::new();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..200 {
            assert!(limiter.check(addr).is_ok());
        }
    }

    #[test]
    fn addresses_are_isolated() {
        let limiter = RateLimiter::new();
        let hot: IpAddr = "203.0.113.9".parse().unwrap();
        let cold: IpAddr = "203.0.113.10".parse().unwrap();

        while limiter.check(hot).is_ok() {}
        assert!(limiter.check(cold).is_ok());
    }
}
