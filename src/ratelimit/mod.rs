//! Rate limiting and failure backoff for external APIs
//!
//! Two orthogonal mechanisms guard every outbound call:
//!
//! - [`BackoffStore`]: persisted failure streaks with a stepped cooldown
//! - [`RequestLimiter`]: in-process token buckets (requests per minute)
//!
//! [`ApiGate`] combines them; both must pass before a call proceeds.

pub mod backoff;
pub mod limiter;

pub use backoff::{backoff_duration, BackoffStore};
pub use limiter::RequestLimiter;

use chrono::{DateTime, Utc};

use crate::config::ApisConfig;
use crate::error::Result;
use crate::storage::SharedStore;

/// Outcome of asking whether an API may be called now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Call may proceed; one request slot has been consumed
    Open,
    /// A failure cooldown is active
    BackingOff,
    /// The per-minute quota is exhausted
    RateLimited,
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::BackingOff => "backing_off",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Combined backoff + quota check for outbound calls
pub struct ApiGate {
    backoff: BackoffStore,
    limiter: RequestLimiter,
}

impl ApiGate {
    pub fn new(backoff: BackoffStore, limiter: RequestLimiter) -> Self {
        Self { backoff, limiter }
    }

    /// Gate with quotas taken from configuration
    pub fn from_config(store: SharedStore, apis: &ApisConfig) -> Self {
        Self::new(
            BackoffStore::new(store),
            RequestLimiter::new(apis.quotas()),
        )
    }

    pub fn backoff(&self) -> &BackoffStore {
        &self.backoff
    }

    pub fn permit(&self, api_name: &str) -> Result<GateDecision> {
        self.permit_at(api_name, Utc::now())
    }

    /// Backoff is consulted first so a cooling-down API does not burn quota
    pub fn permit_at(&self, api_name: &str, now: DateTime<Utc>) -> Result<GateDecision> {
        if !self.backoff.check_at(api_name, now)? {
            return Ok(GateDecision::BackingOff);
        }
        if !self.limiter.try_acquire(api_name) {
            return Ok(GateDecision::RateLimited);
        }
        Ok(GateDecision::Open)
    }
}
