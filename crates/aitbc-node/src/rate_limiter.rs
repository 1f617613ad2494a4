// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - RPC RATE LIMITER
//
// Token bucket per remote IP. Integer math (millitokens) — no f64, so
// refill behavior is deterministic across platforms. A refused request
// costs nothing beyond the bucket check.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::safe_lock;

/// Precision multiplier: 1 token = 1000 millitokens.
/// Keeps sub-token refill precision without floating point.
const MILLITOKEN: u64 = 1000;

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    max_tokens_milli: u64,
    refill_rate: u32,
    cleanup_interval: Duration,
    last_cleanup: Arc<Mutex<Instant>>,
}

struct TokenBucket {
    tokens_milli: u64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `requests_per_second` bounds the average rate; `burst_size` bounds
    /// short spikes (defaults to 2x the rate).
    pub fn new(requests_per_second: u32, burst_size: Option<u32>) -> Self {
        let max_tokens = burst_size.unwrap_or(requests_per_second * 2);

        RateLimiter {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens_milli: max_tokens as u64 * MILLITOKEN,
            refill_rate: requests_per_second.max(1),
            cleanup_interval: Duration::from_secs(300),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// True if the request may proceed; false if the bucket is empty.
    pub fn check_rate_limit(&self, ip: IpAddr) -> bool {
        self.cleanup_if_needed();

        let mut buckets = safe_lock(&self.buckets);

        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens_milli: self.max_tokens_milli,
            last_refill: Instant::now(),
        });

        // Integer refill: elapsed_ms * rate == millitokens to add
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        let tokens_to_add_milli = elapsed_ms * self.refill_rate as u64;

        bucket.tokens_milli =
            (bucket.tokens_milli + tokens_to_add_milli).min(self.max_tokens_milli);
        bucket.last_refill = now;

        if bucket.tokens_milli >= MILLITOKEN {
            bucket.tokens_milli -= MILLITOKEN;
            true
        } else {
            false
        }
    }

    /// Seconds until one whole token refills for this IP. Surfaced as the
    /// Retry-After header on 429 responses.
    pub fn retry_after_secs(&self, ip: IpAddr) -> u64 {
        let buckets = safe_lock(&self.buckets);
        let deficit_milli = match buckets.get(&ip) {
            Some(bucket) if bucket.tokens_milli < MILLITOKEN => {
                MILLITOKEN - bucket.tokens_milli
            }
            _ => return 1,
        };
        // rate tokens/sec == rate millitokens/ms; round up to whole seconds
        let ms = deficit_milli.div_ceil(self.refill_rate as u64);
        ms.div_ceil(1000).max(1)
    }

    /// Number of tracked IPs (for monitoring)
    pub fn tracked_ips(&self) -> usize {
        safe_lock(&self.buckets).len()
    }

    fn cleanup_if_needed(&self) {
        let mut last_cleanup = safe_lock(&self.last_cleanup);

        if last_cleanup.elapsed() >= self.cleanup_interval {
            let mut buckets = safe_lock(&self.buckets);
            let now = Instant::now();

            // Drop buckets idle for > 10 minutes
            buckets.retain(|_, bucket| {
                now.duration_since(bucket.last_refill) < Duration::from_secs(600)
            });

            *last_cleanup = now;
        }
    }
}

/// Warp filter integration
pub mod filters {
    use super::RateLimiter;
    use std::net::IpAddr;
    use warp::Filter;

    /// Extract client IP from the request
    pub fn client_ip() -> impl Filter<Extract = (IpAddr,), Error = std::convert::Infallible> + Clone
    {
        warp::addr::remote().map(|addr: Option<std::net::SocketAddr>| {
            addr.map(|a| a.ip())
                .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
        })
    }

    /// Rejects with RateLimitExceeded when the bucket is empty
    pub fn rate_limit(
        limiter: RateLimiter,
    ) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
        client_ip()
            .and(warp::any().map(move || limiter.clone()))
            .and_then(|ip: IpAddr, limiter: RateLimiter| async move {
                if limiter.check_rate_limit(ip) {
                    Ok(())
                } else {
                    let retry_after = limiter.retry_after_secs(ip);
                    Err(warp::reject::custom(RateLimitExceeded { ip, retry_after }))
                }
            })
            .untuple_one()
    }

    #[derive(Debug)]
    pub struct RateLimitExceeded {
        pub ip: IpAddr,
        pub retry_after: u64,
    }

    impl warp::reject::Reject for RateLimitExceeded {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    #[test]
    fn test_allows_burst_then_blocks() {
        let limiter = RateLimiter::new(10, Some(20));
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        for i in 0..20 {
            assert!(limiter.check_rate_limit(ip), "request {} should pass", i);
        }
        assert!(!limiter.check_rate_limit(ip), "request 21 should be blocked");
        assert!(limiter.retry_after_secs(ip) >= 1);
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = RateLimiter::new(10, Some(10));
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));

        for _ in 0..10 {
            assert!(limiter.check_rate_limit(ip));
        }
        assert!(!limiter.check_rate_limit(ip));

        thread::sleep(Duration::from_secs(1));

        for i in 0..10 {
            assert!(
                limiter.check_rate_limit(ip),
                "refilled request {} should pass",
                i
            );
        }
    }

    #[test]
    fn test_buckets_are_per_ip() {
        let limiter = RateLimiter::new(5, Some(5));
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        for _ in 0..5 {
            assert!(limiter.check_rate_limit(ip1));
        }
        assert!(!limiter.check_rate_limit(ip1));

        for i in 0..5 {
            assert!(limiter.check_rate_limit(ip2), "ip2 request {} should pass", i);
        }
        assert_eq!(limiter.tracked_ips(), 2);
    }
}
