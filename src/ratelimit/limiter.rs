//! Steady-state request quotas
//!
//! One token bucket per API, held in process. Independent of failure
//! backoff: a healthy API is still limited to its requests-per-minute.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-API token buckets
pub struct RequestLimiter {
    limiters: HashMap<String, DirectLimiter>,
}

impl RequestLimiter {
    /// Build from `(api_name, requests_per_minute)` pairs
    pub fn new<'a>(quotas: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let limiters = quotas
            .into_iter()
            .map(|(api, per_minute)| {
                let rate = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
                (api.to_string(), RateLimiter::direct(Quota::per_minute(rate)))
            })
            .collect();
        Self { limiters }
    }

    /// Take one request slot for `api_name` if available.
    ///
    /// APIs without a configured quota are not limited.
    pub fn try_acquire(&self, api_name: &str) -> bool {
        match self.limiters.get(api_name) {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn has_quota(&self, api_name: &str) -> bool {
        self.limiters.contains_key(api_name)
    }
}
