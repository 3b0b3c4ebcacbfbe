//! Periodic score propagation: votes → candidates → sources → tags

use serde::Serialize;
use std::collections::HashMap;

use crate::config::ScoreWeights;
use crate::error::Result;
use crate::models::{CandidateUpdate, Source, SourceId};
use crate::storage::{CandidateQuery, CandidateRepository, FeedbackRepository, SourceRepository};

/// Counts of rows rewritten by one propagation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub candidates: usize,
    pub sources: usize,
    pub tags: usize,
}

/// `0.5 + 1 / (1 + e^-avg)`, ranging over (0.5, 1.5)
pub fn trust_from_average(avg: f64) -> f64 {
    0.5 + 1.0 / (1.0 + (-avg).exp())
}

/// Recompute every derived score from the vote log.
///
/// Candidate scores are full sums of their votes; only changed scores are
/// written. Sources and tags are always rewritten.
pub fn propagate_scores<S>(store: &S, weights: &ScoreWeights) -> Result<PropagationReport>
where
    S: CandidateRepository + SourceRepository + FeedbackRepository + ?Sized,
{
    let mut report = PropagationReport::default();
    let totals = store.vote_totals()?;
    let mut candidates = store.select_candidates(&CandidateQuery::new())?;

    for candidate in &mut candidates {
        let score = totals.get(&candidate.id).copied().unwrap_or(0) as f64;
        if candidate.direct_score != score {
            store.update_candidate(candidate.id, &CandidateUpdate::score(score))?;
            candidate.direct_score = score;
            report.candidates += 1;
        }
    }

    let mut scores_by_source: HashMap<SourceId, Vec<f64>> = HashMap::new();
    for candidate in &candidates {
        if let Some(feed_id) = candidate.feed_id {
            scores_by_source
                .entry(feed_id)
                .or_default()
                .push(candidate.direct_score);
        }
    }

    for source in store.list_sources()? {
        let (avg, trust) = match scores_by_source.get(&source.id) {
            Some(scores) if !scores.is_empty() => {
                let avg = scores.iter().sum::<f64>() / scores.len() as f64;
                (avg, trust_from_average(avg))
            }
            // No candidates: no signal, trust stays neutral
            _ => (0.0, Source::NEUTRAL_TRUST),
        };
        store.update_source_scores(source.id, trust, avg)?;
        report.sources += 1;
    }

    for tag in store.list_tags()? {
        let source_ids = store.tag_source_ids(tag.id)?;
        if source_ids.is_empty() {
            continue;
        }
        let total: f64 = source_ids
            .iter()
            .filter_map(|id| scores_by_source.get(id))
            .flatten()
            .sum();
        store.update_tag_score(tag.id, total * weights.vote_to_tag)?;
        report.tags += 1;
    }

    tracing::info!(
        candidates = report.candidates,
        sources = report.sources,
        tags = report.tags,
        "Score propagation complete"
    );
    Ok(report)
}
