//! Live timer adjustment from feedback on the current candidate
//!
//! The end time is always recomputed from the rotation's `started_at`, so
//! repeated ticks with the same votes land on the same value.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::ScoreWeights;
use crate::models::Vote;

/// Minimum change (milliseconds) before an adjusted end time is written back
pub const WRITE_THRESHOLD_MS: i64 = 1_000;

/// What the feedback on the current rotation calls for
#[derive(Debug, Clone, PartialEq)]
pub enum TimerDecision {
    /// One user reached the downvote threshold; rotate now
    Veto { user_id: String, downvotes: usize },
    /// The end time moved by more than [`WRITE_THRESHOLD_MS`]
    Adjust { rotation_ends_at: DateTime<Utc> },
    /// Nothing to write
    Unchanged,
}

/// Vote tallies within the current rotation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub upvotes: usize,
    pub downvotes: usize,
}

impl VoteTally {
    pub fn from_votes(votes: &[Vote]) -> Self {
        votes.iter().fold(Self::default(), |mut tally, vote| {
            if vote.is_up() {
                tally.upvotes += 1;
            } else if vote.is_down() {
                tally.downvotes += 1;
            }
            tally
        })
    }
}

/// First user (by vote order) whose downvote count reaches `threshold`
pub fn vetoing_user(votes: &[Vote], threshold: usize) -> Option<(String, usize)> {
    let mut per_user: HashMap<&str, usize> = HashMap::new();
    for vote in votes.iter().filter(|v| v.is_down()) {
        let count = per_user.entry(vote.user_id.as_str()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            return Some((vote.user_id.clone(), *count));
        }
    }
    None
}

/// `started_at + default + bonus - penalty`, never earlier than `started_at`.
/// Saturates at the latest representable instant instead of overflowing.
pub fn adjusted_end(
    started_at: DateTime<Utc>,
    tally: VoteTally,
    weights: &ScoreWeights,
) -> DateTime<Utc> {
    let scaled = |per_vote: Duration, votes: usize| {
        per_vote
            .num_milliseconds()
            .saturating_mul(i64::try_from(votes).unwrap_or(i64::MAX))
    };
    let offset_ms = weights
        .rotation_default()
        .num_milliseconds()
        .saturating_add(scaled(weights.upvote_bonus(), tally.upvotes))
        .saturating_sub(scaled(weights.downvote_penalty(), tally.downvotes))
        .max(0);
    Duration::try_milliseconds(offset_ms)
        .and_then(|offset| started_at.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decide what the votes cast since `started_at` mean for the rotation
pub fn evaluate(
    started_at: DateTime<Utc>,
    current_end: Option<DateTime<Utc>>,
    votes: &[Vote],
    weights: &ScoreWeights,
) -> TimerDecision {
    if let Some((user_id, downvotes)) = vetoing_user(votes, weights.skip_threshold()) {
        return TimerDecision::Veto { user_id, downvotes };
    }

    let end = adjusted_end(started_at, VoteTally::from_votes(votes), weights);
    match current_end {
        Some(current) if (end - current).num_milliseconds().abs() <= WRITE_THRESHOLD_MS => {
            TimerDecision::Unchanged
        }
        _ => TimerDecision::Adjust {
            rotation_ends_at: end,
        },
    }
}
