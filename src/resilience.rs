//! Resilience utilities: token-bucket rate limiting for inbound traffic.
//!
//! Prevents thundering herd when many peers rebroadcast at once. The write
//! pipeline acquires a permit per inbound `put`; anti-entropy frames are
//! exempt so reconciliation can always make progress.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use meshkv::resilience::{RateLimiter, RateLimitConfig};
//!
//! // Rate limit: max 1000 events/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// Configuration for rate limiting.
///
/// Uses a token bucket: tokens refill at `refill_rate` per second, up to
/// `burst_size` tokens. Each inbound event consumes one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 events/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Aggressive rate limit for testing or constrained environments.
    pub fn conservative() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 100,
        }
    }

    /// High throughput for production with beefy hardware.
    pub fn high_throughput() -> Self {
        Self {
            burst_size: 500,
            refill_rate: 10_000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limit_config_presets() {
        let default = RateLimitConfig::default();
        assert_eq!(default.burst_size, 100);
        assert_eq!(default.refill_rate, 1000);

        let conservative = RateLimitConfig::conservative();
        assert_eq!(conservative.burst_size, 10);
        assert_eq!(conservative.refill_rate, 100);

        let high = RateLimitConfig::high_throughput();
        assert_eq!(high.burst_size, 500);
        assert_eq!(high.refill_rate, 10_000);
    }

    #[test]
    fn test_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1000,
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }

        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_acquire_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000, // 1ms per token
        });

        limiter.acquire().await;

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "should refill quickly"
        );
    }

    #[test]
    fn test_config_accessor() {
        let config = RateLimitConfig::conservative();
        let limiter = RateLimiter::new(config.clone());
        assert_eq!(limiter.config().burst_size, config.burst_size);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = RateLimitConfig::high_throughput();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RateLimitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.refill_rate, 10_000);
    }
}
