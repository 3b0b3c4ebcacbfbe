//! Repository Pattern for Store Abstraction
//!
//! The Director and the Priority Worker never talk to each other directly;
//! every piece of coordination goes through these traits. Each trait covers
//! one table family, and [`Store`] bundles them so a single handle can be
//! passed around.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Director / PriorityWorker                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Repository Traits                         │
//! │  CandidateRepository, RotationRepository, TaskQueue, ...    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//!       ┌─────────────────┐         ┌─────────────────┐
//!       │     SQLite      │         │     Memory      │
//!       │  SqliteStore    │         │  MemoryStore    │
//!       └─────────────────┘         └─────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AiUsage, Candidate, CandidateId, CandidateUpdate, DecisionLogEntry, Discussion, NewCandidate,
    NewTask, Nomination, PriorityClass, RateLimitRecord, RotationState, Source, SourceId, Tag,
    Task, TaskId, TaskStatus, Vote,
};

/// Maximum stored length of an error message
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate an error message to [`MAX_ERROR_LEN`] characters
pub fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}

// ============================================================================
// Candidate Query
// ============================================================================

/// Filter on `direct_score`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreFilter {
    #[default]
    Any,
    /// `direct_score == 0`
    Zero,
    /// `direct_score > 0`
    Positive,
}

/// Sort order of a candidate query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateOrder {
    #[default]
    Id,
    /// Fewest `times_shown` first
    TimesShownAsc,
    /// Highest `direct_score` first
    ScoreDesc,
}

/// Filter/order/limit query over candidates
///
/// Ties are always broken by ascending id so results are stable across
/// store implementations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateQuery {
    pub score: ScoreFilter,
    pub order: CandidateOrder,
    pub exclude: Vec<CandidateId>,
    pub limit: Option<usize>,
}

impl CandidateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(mut self, score: ScoreFilter) -> Self {
        self.score = score;
        self
    }

    pub fn order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    pub fn excluding(mut self, ids: &[CandidateId]) -> Self {
        self.exclude.extend_from_slice(ids);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a candidate passes the filter part of this query
    pub fn matches(&self, candidate: &Candidate) -> bool {
        let score_ok = match self.score {
            ScoreFilter::Any => true,
            ScoreFilter::Zero => candidate.direct_score == 0.0,
            ScoreFilter::Positive => candidate.direct_score > 0.0,
        };
        score_ok && !self.exclude.contains(&candidate.id)
    }
}

/// Aggregate queue counts for status reporting
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct QueueCounts {
    pub by_status: BTreeMap<String, i64>,
}

impl QueueCounts {
    pub fn get(&self, status: TaskStatus) -> i64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Content items
pub trait CandidateRepository: Send + Sync {
    /// Insert a candidate, returning its id
    fn insert_candidate(&self, candidate: &NewCandidate) -> Result<CandidateId>;

    /// Get candidate by id
    fn get_candidate(&self, id: CandidateId) -> Result<Option<Candidate>>;

    /// Run a filter/order/limit query
    fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>>;

    /// Apply a partial update; errors with `NotFound` for unknown ids
    fn update_candidate(&self, id: CandidateId, update: &CandidateUpdate) -> Result<()>;

    /// Count all candidates
    fn count_candidates(&self) -> Result<usize>;
}

/// Sources and tag groupings
pub trait SourceRepository: Send + Sync {
    fn insert_source(&self, name: &str, kind: &str) -> Result<SourceId>;

    fn get_source(&self, id: SourceId) -> Result<Option<Source>>;

    fn list_sources(&self) -> Result<Vec<Source>>;

    /// Store propagated aggregates for a source
    fn update_source_scores(&self, id: SourceId, trust_score: f64, avg_link_score: f64)
        -> Result<()>;

    fn insert_tag(&self, name: &str) -> Result<i64>;

    /// Link a source to a tag (idempotent)
    fn link_tag_source(&self, tag_id: i64, source_id: SourceId) -> Result<()>;

    fn list_tags(&self) -> Result<Vec<Tag>>;

    fn tag_source_ids(&self, tag_id: i64) -> Result<Vec<SourceId>>;

    fn update_tag_score(&self, tag_id: i64, score: f64) -> Result<()>;
}

/// Votes and nominations (append-only logs)
pub trait FeedbackRepository: Send + Sync {
    fn record_vote(&self, vote: &Vote) -> Result<()>;

    /// Votes on one candidate with `created_at >= since`
    fn votes_since(&self, candidate_id: CandidateId, since: DateTime<Utc>) -> Result<Vec<Vote>>;

    /// `(source kind, vote value)` for every vote since `since`, joined through
    /// the candidate's source; kind is `None` for candidates without a source
    fn vote_kinds_since(&self, since: DateTime<Utc>) -> Result<Vec<(Option<String>, i8)>>;

    /// Sum of all vote values per candidate
    fn vote_totals(&self) -> Result<BTreeMap<CandidateId, i64>>;

    fn add_nomination(&self, nomination: &Nomination) -> Result<()>;

    /// Nominations for an epoch, in insertion order
    fn nominations_for(&self, rotation_id: &str) -> Result<Vec<Nomination>>;

    /// Delete every nomination for an epoch, returning how many were removed
    fn clear_nominations(&self, rotation_id: &str) -> Result<usize>;
}

/// The rotation singleton and the decision log
pub trait RotationRepository: Send + Sync {
    /// Read the singleton rotation state
    fn load_rotation(&self) -> Result<RotationState>;

    /// Overwrite the singleton in place
    fn save_rotation(&self, state: &RotationState) -> Result<()>;

    /// Update only `rotation_ends_at`
    fn set_rotation_ends_at(&self, ends_at: DateTime<Utc>) -> Result<()>;

    /// Number of stored rotation state rows (always 1 once initialised)
    fn rotation_row_count(&self) -> Result<usize>;

    fn append_decision(&self, entry: &DecisionLogEntry) -> Result<()>;

    /// Up to `n` most recent distinct candidate ids, newest first
    fn recent_shown_ids(&self, n: usize) -> Result<Vec<CandidateId>>;

    /// Up to `n` most recent decisions, newest first
    fn recent_decisions(&self, n: usize) -> Result<Vec<DecisionLogEntry>>;
}

/// Enrichment task queue
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task unless an active one exists for the same candidate and type
    fn enqueue(&self, task: &NewTask) -> Result<Option<TaskId>>;

    fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Oldest pending task of a class
    fn next_pending(&self, class: PriorityClass) -> Result<Option<Task>>;

    /// Move a pending task to in_progress and count the attempt.
    /// Returns false when the task was no longer pending.
    fn claim(&self, id: TaskId) -> Result<bool>;

    fn mark_done(&self, id: TaskId) -> Result<()>;

    /// Record a failed attempt. The task returns to pending while attempts
    /// remain and becomes terminally failed otherwise.
    fn mark_failed(&self, id: TaskId, error: &str, max_attempts: u32) -> Result<TaskStatus>;

    /// Undo a claim: an in_progress task goes back to pending and the
    /// attempt is no longer counted. Returns false when the task had
    /// already left in_progress.
    fn release(&self, id: TaskId) -> Result<bool>;

    /// Return every in_progress task to pending
    fn reset_in_progress(&self) -> Result<usize>;

    fn queue_counts(&self) -> Result<QueueCounts>;

    /// Claim the oldest pending task of the highest-priority non-empty class
    fn claim_next(&self, order: &[PriorityClass]) -> Result<Option<Task>> {
        for class in order {
            if let Some(task) = self.next_pending(*class)? {
                if self.claim(task.id)? {
                    return self.get_task(task.id);
                }
            }
        }
        Ok(None)
    }
}

/// Persistent per-API backoff records
pub trait RateLimitRepository: Send + Sync {
    fn get_rate_limit(&self, api_name: &str) -> Result<Option<RateLimitRecord>>;

    /// Insert or overwrite the record for `record.api_name`
    fn put_rate_limit(&self, record: &RateLimitRecord) -> Result<()>;

    fn list_rate_limits(&self) -> Result<Vec<RateLimitRecord>>;
}

/// Tunable score weights
pub trait SettingsRepository: Send + Sync {
    /// All stored `(key, value)` pairs
    fn score_weights(&self) -> Result<Vec<(String, f64)>>;

    fn set_score_weight(&self, key: &str, value: f64) -> Result<()>;
}

/// Enrichment outputs and metered usage
pub trait EnrichmentRepository: Send + Sync {
    /// Replace the stored discussions of a candidate for one platform
    fn save_discussions(
        &self,
        candidate_id: CandidateId,
        platform: &str,
        discussions: &[Discussion],
    ) -> Result<usize>;

    fn discussions_for(&self, candidate_id: CandidateId) -> Result<Vec<Discussion>>;

    fn record_ai_usage(&self, usage: &AiUsage) -> Result<()>;

    /// Total `cost_usd` recorded at or after `since`
    fn ai_spend_since(&self, since: DateTime<Utc>) -> Result<f64>;
}

/// Everything the core needs from persistence
pub trait Store:
    CandidateRepository
    + SourceRepository
    + FeedbackRepository
    + RotationRepository
    + TaskQueue
    + RateLimitRepository
    + SettingsRepository
    + EnrichmentRepository
{
}

impl<T> Store for T where
    T: CandidateRepository
        + SourceRepository
        + FeedbackRepository
        + RotationRepository
        + TaskQueue
        + RateLimitRepository
        + SettingsRepository
        + EnrichmentRepository
{
}

// ============================================================================
// Shared Store Types
// ============================================================================

/// Thread-safe shared store handle
pub type SharedStore = Arc<dyn Store>;

/// Create a shared SQLite store
pub fn create_sqlite_store(path: impl AsRef<std::path::Path>) -> Result<SharedStore> {
    Ok(Arc::new(super::SqliteStore::new(path)?))
}

/// Create a shared in-memory store
pub fn create_memory_store() -> SharedStore {
    Arc::new(super::MemoryStore::new())
}
