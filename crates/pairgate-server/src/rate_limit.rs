use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

/// Pairing sessions a single client address may start per window.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub sessions_per_window: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sessions_per_window: 10,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    limit: u32,
    window: Duration,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            tokens: limit,
            last_refill: now,
            limit,
            window,
        }
    }

    fn check(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= self.window {
            self.tokens = self.limit;
            self.last_refill = now;
        } else {
            // Proportional refill; only advance the clock when tokens were added
            let refill = (self.limit as f64 * elapsed.as_secs_f64() / self.window.as_secs_f64()) as u32;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.limit);
                self.last_refill = now;
            }
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= self.window {
            0
        } else {
            let per_token = self.window.as_secs_f64() / self.limit.max(1) as f64;
            (per_token - elapsed.as_secs_f64()).ceil().max(1.0) as u64
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_refill) >= self.window
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, TokenBucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Take one session token for `ip`, or return the seconds to wait.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let mut bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.config.sessions_per_window, self.config.window(), now));

        if bucket.check(now) {
            Ok(())
        } else {
            Err(bucket.retry_after(now))
        }
    }

    /// Drop buckets that have fully refilled. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle(now));
        before - self.buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            sessions_per_window: limit,
            window_secs: 60,
        })
    }

    #[test]
    fn test_clients_are_limited_independently() {
        let limiter = limiter(2);
        let now = Instant::now();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check_at(a, now).is_ok());
        assert!(limiter.check_at(a, now).is_ok());
        assert!(limiter.check_at(a, now).is_err());
        assert!(limiter.check_at(b, now).is_ok());
    }

    #[test]
    fn test_window_refills_bucket() {
        let limiter = limiter(1);
        let now = Instant::now();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check_at(ip, now).is_ok());
        let retry = limiter.check_at(ip, now).unwrap_err();
        assert!((1..=60).contains(&retry));
        assert!(limiter.check_at(ip, now + Duration::from_secs(61)).is_ok());
    }

    proptest! {
        #[test]
        fn test_burst_never_exceeds_limit(limit in 1u32..20, attempts in 1usize..60) {
            let limiter = limiter(limit);
            let now = Instant::now();
            let ip: IpAddr = "192.168.1.7".parse().unwrap();

            let allowed = (0..attempts).filter(|_| limiter.check_at(ip, now).is_ok()).count();
            prop_assert_eq!(allowed, attempts.min(limit as usize));
        }
    }
}
