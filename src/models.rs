// Core data structures for the linksite rotation core

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type CandidateId = i64;
pub type SourceId = i64;
pub type TaskId = i64;

// ============================================================================
// Timestamps
// ============================================================================

/// Format a timestamp the way it is persisted.
///
/// Fixed-width RFC3339 in UTC with microseconds, so lexical order of the
/// stored strings equals chronological order.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a persisted timestamp
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Candidates and Sources
// ============================================================================

/// A displayable content item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    /// Vote-derived score, recomputed by propagation
    pub direct_score: f64,
    pub times_shown: i64,
    pub last_shown_at: Option<DateTime<Utc>>,
    /// Weak reference to the originating source
    pub feed_id: Option<SourceId>,
    /// Optional embedding; not used by selection
    pub content_vector: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Hours since this candidate was last on stage
    pub fn hours_since_shown(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_shown_at
            .map(|last| (now - last).num_milliseconds() as f64 / 3_600_000.0)
    }
}

/// Fields for inserting a candidate
#[derive(Debug, Clone, Default)]
pub struct NewCandidate {
    pub title: String,
    pub url: String,
    pub feed_id: Option<SourceId>,
    pub summary: Option<String>,
    pub direct_score: f64,
}

impl NewCandidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn from_source(mut self, feed_id: SourceId) -> Self {
        self.feed_id = Some(feed_id);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.direct_score = score;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Partial update of a candidate; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateUpdate {
    pub direct_score: Option<f64>,
    pub times_shown: Option<i64>,
    pub last_shown_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

impl CandidateUpdate {
    /// Update recorded when a candidate goes on stage
    pub fn shown(times_shown: i64, at: DateTime<Utc>) -> Self {
        Self {
            times_shown: Some(times_shown),
            last_shown_at: Some(at),
            ..Default::default()
        }
    }

    pub fn score(score: f64) -> Self {
        Self {
            direct_score: Some(score),
            ..Default::default()
        }
    }

    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.direct_score.is_none()
            && self.times_shown.is_none()
            && self.last_shown_at.is_none()
            && self.summary.is_none()
    }
}

/// A feed or origin of candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Feed type (rss, youtube, reddit, ...), used for momentum grouping
    pub kind: String,
    pub trust_score: f64,
    pub avg_link_score: f64,
}

impl Source {
    pub const NEUTRAL_TRUST: f64 = 1.0;
}

/// Tag-like grouping of sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub score: f64,
}

/// A discussion of a candidate found on an external site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub platform: String,
    pub url: String,
    pub title: String,
    pub score: i64,
    pub num_comments: i64,
}

// ============================================================================
// Rotation State
// ============================================================================

/// Why the current candidate was put on stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionReason {
    Fresh,
    Rerun,
    Wildcard,
    Nominated,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Rerun => "rerun",
            Self::Wildcard => "wildcard",
            Self::Nominated => "nominated",
        }
    }
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "rerun" => Ok(Self::Rerun),
            "wildcard" => Ok(Self::Wildcard),
            "nominated" => Ok(Self::Nominated),
            other => Err(format!("unknown selection reason '{other}'")),
        }
    }
}

/// An alternative candidate shown next to the current one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Satellite {
    pub candidate_id: CandidateId,
    pub position: String,
    pub label: String,
    pub reveal_at: DateTime<Utc>,
    pub revealed: bool,
}

/// The singleton "what is on screen" record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub current_candidate_id: Option<CandidateId>,
    pub started_at: Option<DateTime<Utc>>,
    pub rotation_ends_at: Option<DateTime<Utc>>,
    pub reveal_ends_at: Option<DateTime<Utc>>,
    pub selection_reason: Option<SelectionReason>,
    pub satellites: Vec<Satellite>,
}

impl RotationState {
    /// Key identifying this rotation for nominations (its `started_at`)
    pub fn epoch(&self) -> Option<String> {
        self.started_at.map(format_ts)
    }

    pub fn is_satellite(&self, id: CandidateId) -> bool {
        self.satellites.iter().any(|s| s.candidate_id == id)
    }
}

// ============================================================================
// Feedback
// ============================================================================

/// Append-only vote log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub user_id: String,
    pub candidate_id: CandidateId,
    /// -1 or +1
    pub value: i8,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    pub fn up(user_id: impl Into<String>, candidate_id: CandidateId, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            candidate_id,
            value: 1,
            created_at: at,
        }
    }

    pub fn down(user_id: impl Into<String>, candidate_id: CandidateId, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            candidate_id,
            value: -1,
            created_at: at,
        }
    }

    pub fn is_up(&self) -> bool {
        self.value > 0
    }

    pub fn is_down(&self) -> bool {
        self.value < 0
    }
}

/// A request that a satellite become the next rotation's candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nomination {
    /// Epoch key of the rotation the nomination was cast in
    pub rotation_id: String,
    pub candidate_id: CandidateId,
}

/// Short-window aggregate vote signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    /// Net vote score per source type
    pub types: BTreeMap<String, i64>,
    pub total_up: i64,
    pub total_down: i64,
}

/// One row of the decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub candidate_id: CandidateId,
    pub reason: SelectionReason,
    pub momentum: Momentum,
    pub duration_seconds: i64,
    pub selected_at: DateTime<Utc>,
}

// ============================================================================
// Tasks
// ============================================================================

/// Kind of enrichment work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// AI summary of the candidate
    Summarize,
    /// Reddit discussion lookup
    RedditDiscussions,
    /// Hacker News discussion lookup
    HnDiscussions,
}

impl TaskType {
    pub fn all() -> [Self; 3] {
        [Self::Summarize, Self::RedditDiscussions, Self::HnDiscussions]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::RedditDiscussions => "reddit_discussions",
            Self::HnDiscussions => "hn_discussions",
        }
    }

    /// External API this task calls
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Summarize => "anthropic",
            Self::RedditDiscussions => "reddit",
            Self::HnDiscussions => "hn",
        }
    }

    /// Whether the task spends metered budget
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Summarize)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" | "summary" => Ok(Self::Summarize),
            "reddit_discussions" | "reddit" => Ok(Self::RedditDiscussions),
            "hn_discussions" | "hn" => Ok(Self::HnDiscussions),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// Queue class, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    ReverseLookup,
    UserSubmitted,
    RecentlyIngested,
    Backlog,
}

impl PriorityClass {
    /// All classes in the order the worker drains them
    pub const ORDER: [Self; 4] = [
        Self::ReverseLookup,
        Self::UserSubmitted,
        Self::RecentlyIngested,
        Self::Backlog,
    ];

    /// 0 is the most urgent
    pub fn rank(&self) -> i64 {
        match self {
            Self::ReverseLookup => 0,
            Self::UserSubmitted => 1,
            Self::RecentlyIngested => 2,
            Self::Backlog => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReverseLookup => "reverse_lookup",
            Self::UserSubmitted => "user_submitted",
            Self::RecentlyIngested => "recently_ingested",
            Self::Backlog => "backlog",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reverse_lookup" => Ok(Self::ReverseLookup),
            "user_submitted" => Ok(Self::UserSubmitted),
            "recently_ingested" => Ok(Self::RecentlyIngested),
            "backlog" => Ok(Self::Backlog),
            other => Err(format!("unknown priority class '{other}'")),
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    /// Terminal: attempts exhausted
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Pending or in progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Unit of enrichment work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub candidate_id: CandidateId,
    pub task_type: TaskType,
    pub priority_class: PriorityClass,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for enqueuing a task
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub candidate_id: CandidateId,
    pub task_type: TaskType,
    pub priority_class: PriorityClass,
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        candidate_id: CandidateId,
        task_type: TaskType,
        priority_class: PriorityClass,
    ) -> Self {
        Self {
            candidate_id,
            task_type,
            priority_class,
            created_at: Utc::now(),
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

// ============================================================================
// Rate limiting and usage
// ============================================================================

/// Persistent failure/backoff state for one external API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub api_name: String,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RateLimitRecord {
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            consecutive_failures: 0,
            backoff_until: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }
}

/// Read-only backoff snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffStatus {
    pub api_name: String,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub is_backing_off: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Metered AI call record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub candidate_id: Option<CandidateId>,
    pub created_at: DateTime<Utc>,
}
