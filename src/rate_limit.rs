use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

/// Token-bucket limiter keyed on (workspace, route class); unauthenticated
/// surfaces key on the caller address instead.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    refill_per_sec: f64,
    burst: f64,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn from_config() -> Arc<Self> {
        Self::new(*config::RATE_LIMIT_REFILL_PER_SEC, *config::RATE_LIMIT_BURST)
    }

    pub fn new(refill_per_sec: f64, burst: f64) -> Arc<Self> {
        Arc::new(RateLimiter {
            buckets: DashMap::new(),
            refill_per_sec: refill_per_sec.max(0.0),
            burst: burst.max(1.0),
        })
    }

    pub fn workspace_key(workspace_id: Uuid, route_class: &str) -> String {
        format!("ws:{workspace_id}:{route_class}")
    }

    pub fn anonymous_key(addr: &str, route_class: &str) -> String {
        format!("anon:{addr}:{route_class}")
    }

    pub fn check(&self, key: &str) -> AppResult<()> {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                updated: now,
            });
        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.updated = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(AppError::RateLimited)
        }
    }
}
