//! Token-bucket rate limiter keyed on principal or remote host.
//!
//! Buckets refill continuously at `rate` tokens/second up to `burst`; a
//! request consumes one token. Idle buckets are evicted passively inside
//! [`TokenBucketRateLimiter::allow`]. The critical section is O(1) over the
//! bucket count and never does I/O.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub authenticated_per_second: f64,
    pub authenticated_burst: f64,
    pub unauthenticated_per_second: f64,
    pub unauthenticated_burst: f64,
    pub bucket_ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            authenticated_per_second: 20.0,
            authenticated_burst: 60.0,
            unauthenticated_per_second: 5.0,
            unauthenticated_burst: 20.0,
            bucket_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct TokenBucketRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    config: RateLimiterConfig,
}

impl TokenBucketRateLimiter {
    /// Non-positive config values fall back to the defaults.
    pub fn new(mut config: RateLimiterConfig) -> Self {
        let defaults = RateLimiterConfig::default();
        if config.authenticated_per_second <= 0.0 {
            config.authenticated_per_second = defaults.authenticated_per_second;
        }
        if config.authenticated_burst <= 0.0 {
            config.authenticated_burst = defaults.authenticated_burst;
        }
        if config.unauthenticated_per_second <= 0.0 {
            config.unauthenticated_per_second = defaults.unauthenticated_per_second;
        }
        if config.unauthenticated_burst <= 0.0 {
            config.unauthenticated_burst = defaults.unauthenticated_burst;
        }
        if config.bucket_ttl.is_zero() {
            config.bucket_ttl = defaults.bucket_ttl;
        }

        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns false when the identifier is out of tokens.
    pub fn allow(&self, identifier: &str, authenticated: bool) -> bool {
        self.allow_at(Instant::now(), identifier, authenticated)
    }

    fn allow_at(&self, now: Instant, identifier: &str, authenticated: bool) -> bool {
        let (rate, burst) = if authenticated {
            (
                self.config.authenticated_per_second,
                self.config.authenticated_burst,
            )
        } else {
            (
                self.config.unauthenticated_per_second,
                self.config.unauthenticated_burst,
            )
        };

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) <= self.config.bucket_ttl);

        match buckets.entry(identifier.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TokenBucket {
                    tokens: burst - 1.0,
                    last_refill: now,
                    last_seen: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                if elapsed > 0.0 {
                    bucket.tokens = burst.min(bucket.tokens + elapsed * rate);
                    bucket.last_refill = now;
                }
                bucket.last_seen = now;
                if bucket.tokens < 1.0 {
                    return false;
                }
                bucket.tokens -= 1.0;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimiterConfig) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter::new(config)
    }

    #[test]
    fn test_burst_bounds_initial_requests() {
        let rl = limiter(RateLimiterConfig {
            unauthenticated_per_second: 1.0,
            unauthenticated_burst: 3.0,
            ..Default::default()
        });
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.allow_at(now, "ip:10.0.0.1", false));
        }
        assert!(!rl.allow_at(now, "ip:10.0.0.1", false));
    }

    #[test]
    fn test_refill_restores_tokens_up_to_burst() {
        let rl = limiter(RateLimiterConfig {
            unauthenticated_per_second: 2.0,
            unauthenticated_burst: 2.0,
            ..Default::default()
        });
        let start = Instant::now();
        assert!(rl.allow_at(start, "ip:a", false));
        assert!(rl.allow_at(start, "ip:a", false));
        assert!(!rl.allow_at(start, "ip:a", false));

        // 1 second at 2 tokens/sec refills both slots, capped at burst.
        let later = start + Duration::from_secs(1);
        assert!(rl.allow_at(later, "ip:a", false));
        assert!(rl.allow_at(later, "ip:a", false));
        assert!(!rl.allow_at(later, "ip:a", false));

        // A long idle period still caps at burst.
        let much_later = later + Duration::from_secs(60);
        assert!(rl.allow_at(much_later, "ip:a", false));
        assert!(rl.allow_at(much_later, "ip:a", false));
        assert!(!rl.allow_at(much_later, "ip:a", false));
    }

    #[test]
    fn test_window_admits_at_most_burst_plus_rate_times_t() {
        // Invariant: in a window of T seconds at most burst + rate*T pass.
        let rate = 5.0;
        let burst = 10.0;
        let rl = limiter(RateLimiterConfig {
            authenticated_per_second: rate,
            authenticated_burst: burst,
            ..Default::default()
        });
        let start = Instant::now();
        let window_secs = 4u64;
        let mut admitted = 0u64;
        // Hammer in 100ms steps across the window.
        for tick in 0..=(window_secs * 10) {
            let now = start + Duration::from_millis(tick * 100);
            for _ in 0..20 {
                if rl.allow_at(now, "key:k1", true) {
                    admitted += 1;
                }
            }
        }
        let bound = (burst + rate * window_secs as f64) as u64;
        assert!(admitted <= bound, "admitted {admitted} > bound {bound}");
    }

    #[test]
    fn test_identifiers_are_independent() {
        let rl = limiter(RateLimiterConfig {
            unauthenticated_per_second: 1.0,
            unauthenticated_burst: 1.0,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(rl.allow_at(now, "ip:a", false));
        assert!(!rl.allow_at(now, "ip:a", false));
        assert!(rl.allow_at(now, "ip:b", false));
    }

    #[test]
    fn test_idle_buckets_are_evicted_after_ttl() {
        let rl = limiter(RateLimiterConfig {
            unauthenticated_per_second: 0.001,
            unauthenticated_burst: 1.0,
            bucket_ttl: Duration::from_secs(10),
            ..Default::default()
        });
        let start = Instant::now();
        assert!(rl.allow_at(start, "ip:a", false));
        assert!(!rl.allow_at(start, "ip:a", false));

        // Past the TTL the bucket is evicted, so the caller gets a fresh
        // burst even though the old bucket had no tokens left.
        let later = start + Duration::from_secs(11);
        assert!(rl.allow_at(later, "ip:a", false));
    }

    #[test]
    fn test_non_positive_config_falls_back_to_defaults() {
        let rl = limiter(RateLimiterConfig {
            authenticated_per_second: 0.0,
            authenticated_burst: -1.0,
            unauthenticated_per_second: 0.0,
            unauthenticated_burst: 0.0,
            bucket_ttl: Duration::ZERO,
        });
        assert_eq!(rl.config.authenticated_per_second, 20.0);
        assert_eq!(rl.config.authenticated_burst, 60.0);
        assert_eq!(rl.config.unauthenticated_per_second, 5.0);
        assert_eq!(rl.config.unauthenticated_burst, 20.0);
        assert_eq!(rl.config.bucket_ttl, Duration::from_secs(600));
    }
}
