//! Selection context: recent vote momentum and fatigue

use chrono::{DateTime, Utc};

use crate::config::ScoreWeights;
use crate::error::Result;
use crate::models::{CandidateId, Momentum};
use crate::storage::{FeedbackRepository, RotationRepository};

/// Source type used for votes on candidates without a known source
pub const UNKNOWN_KIND: &str = "unknown";

/// Aggregate votes from the last `momentum_window_min` minutes
pub fn compute_momentum<S>(
    store: &S,
    now: DateTime<Utc>,
    weights: &ScoreWeights,
) -> Result<Momentum>
where
    S: FeedbackRepository + ?Sized,
{
    let since = now - weights.momentum_window();
    let mut momentum = Momentum::default();

    for (kind, value) in store.vote_kinds_since(since)? {
        if value > 0 {
            momentum.total_up += 1;
        } else if value < 0 {
            momentum.total_down += 1;
        }
        let kind = kind.unwrap_or_else(|| UNKNOWN_KIND.to_string());
        *momentum.types.entry(kind).or_insert(0) += i64::from(value);
    }

    Ok(momentum)
}

/// Most recently shown distinct candidates, newest first
pub fn fatigue_list<S>(store: &S, weights: &ScoreWeights) -> Result<Vec<CandidateId>>
where
    S: RotationRepository + ?Sized,
{
    let lookback = weights.fatigue_lookback();
    if lookback == 0 {
        return Ok(Vec::new());
    }
    store.recent_shown_ids(lookback)
}
