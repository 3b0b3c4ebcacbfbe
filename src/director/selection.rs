//! Pool choice and per-pool candidate selection
//!
//! Every draw goes through the injected RNG so a seeded director makes the
//! same choices for the same store contents.

use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::models::{Candidate, CandidateId, SelectionReason, Source};
use crate::storage::{
    CandidateOrder, CandidateQuery, CandidateRepository, ScoreFilter, SourceRepository,
};

/// Fresh pool size
pub const FRESH_LIMIT: usize = 50;
/// Rerun pool size
pub const RERUN_LIMIT: usize = 20;
/// Wildcard pool size
pub const WILDCARD_LIMIT: usize = 200;
/// Fatigued candidates whose sources the wildcard pool avoids
pub const WILDCARD_AVOID_RECENT: usize = 5;
/// Cap on the recency multiplier of rerun weights
pub const RERUN_MAX_HOURS: f64 = 100.0;
/// Recency used for candidates that were never shown
pub const NEVER_SHOWN_HOURS: f64 = 999.0;
/// Floor on the score part of rerun weights
pub const RERUN_MIN_SCORE: f64 = 0.1;

/// Candidate pools the director draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Fresh,
    Rerun,
    Wildcard,
}

impl Pool {
    pub const ALL: [Pool; 3] = [Pool::Fresh, Pool::Rerun, Pool::Wildcard];

    pub fn reason(&self) -> SelectionReason {
        match self {
            Self::Fresh => SelectionReason::Fresh,
            Self::Rerun => SelectionReason::Rerun,
            Self::Wildcard => SelectionReason::Wildcard,
        }
    }
}

/// Weighted draw of a pool; weights are `[fresh, rerun, wildcard]`
pub fn pick_pool(rng: &mut dyn RngCore, weights: [f64; 3]) -> Pool {
    match WeightedIndex::new(weights) {
        Ok(dist) => Pool::ALL[dist.sample(rng)],
        Err(_) => Pool::Fresh,
    }
}

/// Weighted draw from `items`; falls back to a uniform draw when the
/// weights are unusable (all zero, negative or non-finite).
pub fn weighted_pick<T>(rng: &mut dyn RngCore, items: Vec<T>, weights: &[f64]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let index = match WeightedIndex::new(weights) {
        Ok(dist) if weights.len() == items.len() => dist.sample(rng),
        _ => rng.gen_range(0..items.len()),
    };
    items.into_iter().nth(index)
}

/// Draw one candidate from `pool`.
///
/// Returns the reason actually recorded: a rerun pool with nothing in it
/// falls back to fresh and reports `fresh`.
pub fn select_from_pool<S>(
    store: &S,
    rng: &mut dyn RngCore,
    pool: Pool,
    fatigue: &[CandidateId],
    now: DateTime<Utc>,
) -> Result<Option<(Candidate, SelectionReason)>>
where
    S: CandidateRepository + SourceRepository + ?Sized,
{
    let picked = match pool {
        Pool::Fresh => select_fresh(store, rng, fatigue)?.map(|c| (c, SelectionReason::Fresh)),
        Pool::Rerun => match select_rerun(store, rng, fatigue, now)? {
            Some(c) => Some((c, SelectionReason::Rerun)),
            None => select_fresh(store, rng, fatigue)?.map(|c| (c, SelectionReason::Fresh)),
        },
        Pool::Wildcard => {
            select_wildcard(store, rng, fatigue)?.map(|c| (c, SelectionReason::Wildcard))
        }
    };
    Ok(picked)
}

/// Unscored, least-shown candidates weighted by source trust
pub fn select_fresh<S>(
    store: &S,
    rng: &mut dyn RngCore,
    fatigue: &[CandidateId],
) -> Result<Option<Candidate>>
where
    S: CandidateRepository + SourceRepository + ?Sized,
{
    let unrestricted: &[CandidateId] = &[];
    let mut pool = Vec::new();
    'search: for exclude in [fatigue, unrestricted] {
        for score in [ScoreFilter::Zero, ScoreFilter::Any] {
            let query = CandidateQuery::new()
                .score(score)
                .order(CandidateOrder::TimesShownAsc)
                .excluding(exclude)
                .limit(FRESH_LIMIT);
            pool = store.select_candidates(&query)?;
            if !pool.is_empty() {
                break 'search;
            }
        }
    }

    if pool.is_empty() {
        return Ok(None);
    }

    let trust = trust_by_source(store.list_sources()?);
    let weights: Vec<f64> = pool
        .iter()
        .map(|c| {
            c.feed_id
                .and_then(|id| trust.get(&id).copied())
                .unwrap_or(Source::NEUTRAL_TRUST)
        })
        .collect();

    Ok(weighted_pick(rng, pool, &weights))
}

/// Best-scored candidates, weighted by score and time since last shown.
///
/// Returns `None` when no positively scored candidate is left after fatigue;
/// the caller falls back to the fresh pool.
pub fn select_rerun<S>(
    store: &S,
    rng: &mut dyn RngCore,
    fatigue: &[CandidateId],
    now: DateTime<Utc>,
) -> Result<Option<Candidate>>
where
    S: CandidateRepository + ?Sized,
{
    let query = CandidateQuery::new()
        .score(ScoreFilter::Positive)
        .order(CandidateOrder::ScoreDesc)
        .excluding(fatigue)
        .limit(RERUN_LIMIT);
    let pool = store.select_candidates(&query)?;
    if pool.is_empty() {
        return Ok(None);
    }

    let weights: Vec<f64> = pool.iter().map(|c| rerun_weight(c, now)).collect();
    Ok(weighted_pick(rng, pool, &weights))
}

/// `max(score, 0.1) × min(hours since shown, 100)`
pub fn rerun_weight(candidate: &Candidate, now: DateTime<Utc>) -> f64 {
    let hours = candidate
        .hours_since_shown(now)
        .unwrap_or(NEVER_SHOWN_HOURS)
        .clamp(0.0, RERUN_MAX_HOURS);
    candidate.direct_score.max(RERUN_MIN_SCORE) * hours
}

/// Uniform draw, preferring sources not seen in the most recent rotations
pub fn select_wildcard<S>(
    store: &S,
    rng: &mut dyn RngCore,
    fatigue: &[CandidateId],
) -> Result<Option<Candidate>>
where
    S: CandidateRepository + ?Sized,
{
    let mut avoid_sources = HashSet::new();
    for id in fatigue.iter().take(WILDCARD_AVOID_RECENT) {
        if let Some(feed_id) = store.get_candidate(*id)?.and_then(|c| c.feed_id) {
            avoid_sources.insert(feed_id);
        }
    }

    let unrestricted: &[CandidateId] = &[];
    for exclude in [fatigue, unrestricted] {
        let query = CandidateQuery::new()
            .excluding(exclude)
            .limit(WILDCARD_LIMIT);
        let pool = store.select_candidates(&query)?;
        if pool.is_empty() {
            continue;
        }

        let diverse: Vec<&Candidate> = pool
            .iter()
            .filter(|c| c.feed_id.map_or(true, |id| !avoid_sources.contains(&id)))
            .collect();
        let picked = if diverse.is_empty() {
            pool.choose(rng)
        } else {
            diverse.choose(rng).copied()
        };
        return Ok(picked.cloned());
    }

    Ok(None)
}

fn trust_by_source(sources: Vec<Source>) -> HashMap<i64, f64> {
    sources.into_iter().map(|s| (s.id, s.trust_score)).collect()
}
