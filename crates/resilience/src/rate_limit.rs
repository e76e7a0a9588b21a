//! Token-bucket admission control keyed by client identity.

use std::time::Duration;

use common::ClientId;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::RateLimitExceeded;

/// Token balance of one client.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}

/// Per-client token buckets.
///
/// Buckets are created full on a client's first request. Memory is bounded
/// by `max_clients`: admitting a new client at the limit evicts the bucket
/// that was used least recently.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<ClientId, RateLimitBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Admits the request if the client has a token left, consuming it.
    pub fn try_admit(&self, client: &ClientId) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        if !self.buckets.contains_key(client) {
            self.evict_if_full();
        }

        let mut bucket = self
            .buckets
            .entry(client.clone())
            .or_insert_with(|| RateLimitBucket::full(self.config.capacity, now));
        bucket.refill(self.config.capacity, self.config.refill_per_second, now);

        if bucket.try_take() {
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens();
        drop(bucket);

        let retry_after = Duration::try_from_secs_f64(missing / self.config.refill_per_second)
            .unwrap_or(Duration::MAX);
        tracing::warn!(client = %client, ?retry_after, "rate limit exceeded");
        metrics::counter!("rate_limit_rejections_total").increment(1);

        Err(RateLimitExceeded {
            client: client.clone(),
            retry_after,
        })
    }

    /// Number of buckets currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Current token balance of a client, if it has a bucket.
    pub fn tokens(&self, client: &ClientId) -> Option<f64> {
        self.buckets.get(client).map(|bucket| bucket.tokens())
    }

    fn evict_if_full(&self) {
        if self.buckets.len() < self.config.max_clients {
            return;
        }
        let oldest = self
            .buckets
            .iter()
            .min_by_key(|entry| entry.value().last_refill())
            .map(|entry| entry.key().clone());
        if let Some(client) = oldest {
            tracing::debug!(client = %client, "evicting idle rate-limit bucket");
            self.buckets.remove(&client);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
