//! Satellite generation and nomination counting

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::{HashMap, HashSet};

use crate::config::ScoreWeights;
use crate::error::Result;
use crate::models::{CandidateId, Nomination, Satellite};
use crate::storage::{CandidateQuery, CandidateRepository};

/// Candidates considered when drawing satellites
pub const SATELLITE_POOL_LIMIT: usize = 100;

/// Screen positions, in reveal order
pub const POSITIONS: [&str; 5] = ["top", "top-left", "top-right", "left", "right"];
/// Position used past the end of [`POSITIONS`]
pub const DEFAULT_POSITION: &str = "top";

/// Labels, in reveal order
pub const LABELS: [&str; 5] = ["Deep Dive", "Deep Dive", "Pivot", "Pivot", "Wildcard"];
/// Label used past the end of [`LABELS`]
pub const DEFAULT_LABEL: &str = "Related";

/// Draw up to `satellite_count` alternatives to `current`.
///
/// Fatigued candidates are left out unless that leaves fewer than needed.
/// Reveal times are spaced `reveal_interval` apart starting one interval
/// after `now`.
pub fn generate_satellites<S>(
    store: &S,
    rng: &mut dyn RngCore,
    current: CandidateId,
    fatigue: &[CandidateId],
    weights: &ScoreWeights,
    now: DateTime<Utc>,
) -> Result<Vec<Satellite>>
where
    S: CandidateRepository + ?Sized,
{
    let count = weights.satellite_count();
    if count == 0 {
        return Ok(Vec::new());
    }

    let pool = store.select_candidates(
        &CandidateQuery::new()
            .excluding(&[current])
            .limit(SATELLITE_POOL_LIMIT),
    )?;

    let fatigued: HashSet<CandidateId> = fatigue.iter().copied().collect();
    let rested: Vec<CandidateId> = pool
        .iter()
        .map(|c| c.id)
        .filter(|id| !fatigued.contains(id))
        .collect();
    let eligible: Vec<CandidateId> = if rested.len() >= count {
        rested
    } else {
        pool.iter().map(|c| c.id).collect()
    };

    let interval = weights.reveal_interval();
    let satellites = eligible
        .choose_multiple(rng, count)
        .enumerate()
        .map(|(i, &candidate_id)| Satellite {
            candidate_id,
            position: POSITIONS.get(i).copied().unwrap_or(DEFAULT_POSITION).to_string(),
            label: LABELS.get(i).copied().unwrap_or(DEFAULT_LABEL).to_string(),
            reveal_at: now + interval * (i as i32 + 1),
            revealed: false,
        })
        .collect();

    Ok(satellites)
}

/// Most-nominated satellite of the outgoing rotation.
///
/// Nominations for candidates that were not satellites are ignored. On a tie
/// the candidate that reached the top count first (in nomination order) wins.
pub fn nomination_winner(
    nominations: &[Nomination],
    satellites: &[Satellite],
) -> Option<(CandidateId, usize)> {
    let eligible: HashSet<CandidateId> = satellites.iter().map(|s| s.candidate_id).collect();
    let mut counts: HashMap<CandidateId, usize> = HashMap::new();
    let mut best: Option<(CandidateId, usize)> = None;

    for nomination in nominations {
        if !eligible.contains(&nomination.candidate_id) {
            continue;
        }
        let count = counts.entry(nomination.candidate_id).or_insert(0);
        *count += 1;
        if best.map_or(true, |(_, top)| *count > top) {
            best = Some((nomination.candidate_id, *count));
        }
    }

    best
}
