//! Per-integration token buckets.
//!
//! One limiter per integration id, bucket size 1, refilled at the configured
//! requests/second. The registry is owned by the executor; a changed rate on
//! the integration record replaces the bucket on next use.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::models::Id;

struct Bucket {
    rate: f64,
    limiter: Arc<DefaultDirectRateLimiter>,
}

#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: DashMap<Id, Bucket>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for an integration, or `None` when the rate is unlimited.
    pub fn limiter_for(&self, integration_id: Id, rate: f64) -> Option<Arc<DefaultDirectRateLimiter>> {
        if !(rate > 0.0) || !rate.is_finite() {
            self.buckets.remove(&integration_id);
            return None;
        }

        if let Some(bucket) = self.buckets.get(&integration_id) {
            if bucket.rate == rate {
                return Some(bucket.limiter.clone());
            }
        }

        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))?;
        let limiter = Arc::new(RateLimiter::direct(quota));
        self.buckets.insert(
            integration_id,
            Bucket {
                rate,
                limiter: limiter.clone(),
            },
        );
        Some(limiter)
    }

    /// Wait until the integration's bucket has a token.
    pub async fn acquire(&self, integration_id: Id, rate: f64) {
        if let Some(limiter) = self.limiter_for(integration_id, rate) {
            limiter.until_ready().await;
        }
    }
}
