//! Failure-driven backoff per external API
//!
//! State is persisted through [`RateLimitRepository`] so a restart does not
//! forget an API that was failing. Checks never block; a caller that is told
//! to back off simply tries again on a later tick.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::metrics;
use crate::models::{BackoffStatus, RateLimitRecord};
use crate::storage::{truncate_error, SharedStore};

/// Cooldown after the given number of consecutive failures.
///
/// 1 → 1 minute, 2 → 5 minutes, 3 or more → 30 minutes (flat cap).
pub fn backoff_duration(consecutive_failures: u32) -> Duration {
    match consecutive_failures {
        0 => Duration::zero(),
        1 => Duration::minutes(1),
        2 => Duration::minutes(5),
        _ => Duration::minutes(30),
    }
}

/// Persistent backoff bookkeeping
#[derive(Clone)]
pub struct BackoffStore {
    store: SharedStore,
}

impl BackoffStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// True when `api_name` may be called now
    pub fn check(&self, api_name: &str) -> Result<bool> {
        self.check_at(api_name, Utc::now())
    }

    /// True iff `now >= backoff_until`. The first check for an API creates
    /// its record.
    pub fn check_at(&self, api_name: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.store.get_rate_limit(api_name)? {
            None => {
                self.store.put_rate_limit(&RateLimitRecord::new(api_name))?;
                tracing::debug!(api = api_name, "Tracking new API");
                Ok(true)
            }
            Some(record) => Ok(record.backoff_until.map_or(true, |until| now >= until)),
        }
    }

    pub fn record_success(&self, api_name: &str) -> Result<()> {
        self.record_success_at(api_name, Utc::now())
    }

    /// Reset the failure streak and clear any cooldown
    pub fn record_success_at(&self, api_name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut record = self
            .store
            .get_rate_limit(api_name)?
            .unwrap_or_else(|| RateLimitRecord::new(api_name));

        record.consecutive_failures = 0;
        record.backoff_until = None;
        record.last_error = None;
        record.last_success_at = Some(now);
        self.store.put_rate_limit(&record)?;

        metrics::set_backoff_active(api_name, false);
        Ok(())
    }

    pub fn record_failure(&self, api_name: &str, error: &str) -> Result<DateTime<Utc>> {
        self.record_failure_at(api_name, error, Utc::now())
    }

    /// Extend the failure streak and start a cooldown; returns its deadline
    pub fn record_failure_at(
        &self,
        api_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut record = self
            .store
            .get_rate_limit(api_name)?
            .unwrap_or_else(|| RateLimitRecord::new(api_name));

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        let until = now + backoff_duration(record.consecutive_failures);
        record.backoff_until = Some(until);
        record.last_failure_at = Some(now);
        record.last_error = Some(truncate_error(error));
        self.store.put_rate_limit(&record)?;

        metrics::set_backoff_active(api_name, true);
        tracing::warn!(
            api = api_name,
            failures = record.consecutive_failures,
            backoff_until = %until,
            "API failure recorded, backing off"
        );
        Ok(until)
    }

    pub fn get_status(&self, api_name: &str) -> Result<BackoffStatus> {
        self.status_at(api_name, Utc::now())
    }

    /// Read-only snapshot; unknown APIs report a clean state without
    /// creating a record
    pub fn status_at(&self, api_name: &str, now: DateTime<Utc>) -> Result<BackoffStatus> {
        let record = self
            .store
            .get_rate_limit(api_name)?
            .unwrap_or_else(|| RateLimitRecord::new(api_name));

        Ok(BackoffStatus {
            is_backing_off: record.backoff_until.is_some_and(|until| now < until),
            api_name: record.api_name,
            consecutive_failures: record.consecutive_failures,
            backoff_until: record.backoff_until,
            last_success_at: record.last_success_at,
            last_failure_at: record.last_failure_at,
            last_error: record.last_error,
        })
    }
}
