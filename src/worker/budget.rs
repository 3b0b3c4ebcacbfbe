//! Monthly spend cap for metered AI calls

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::error::Result;
use crate::storage::SharedStore;

/// First instant of the UTC month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Checks recorded AI spend against the monthly limit
#[derive(Clone)]
pub struct BudgetGuard {
    store: SharedStore,
    monthly_limit_usd: f64,
}

impl BudgetGuard {
    pub fn new(store: SharedStore, monthly_limit_usd: f64) -> Self {
        Self {
            store,
            monthly_limit_usd,
        }
    }

    pub fn monthly_limit_usd(&self) -> f64 {
        self.monthly_limit_usd
    }

    /// Spend recorded since the start of the month
    pub fn spent_at(&self, now: DateTime<Utc>) -> Result<f64> {
        self.store.ai_spend_since(month_start(now))
    }

    /// True while spend is strictly below the limit
    pub fn allows_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let spent = self.spent_at(now)?;
        if spent >= self.monthly_limit_usd {
            tracing::info!(
                spent_usd = spent,
                limit_usd = self.monthly_limit_usd,
                "Monthly AI budget exhausted"
            );
            return Ok(false);
        }
        Ok(true)
    }
}
