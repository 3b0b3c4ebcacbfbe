//! In-memory implementation of the store traits
//!
//! Mirrors the SQLite semantics closely enough to run the same test suite
//! against both, and can be switched into an "unavailable" mode where every
//! call fails, to exercise the storage-failure paths of the loops.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::repository::{
    truncate_error, CandidateOrder, CandidateQuery, CandidateRepository, EnrichmentRepository,
    FeedbackRepository, QueueCounts, RateLimitRepository, RotationRepository, SettingsRepository,
    SourceRepository, TaskQueue,
};
use crate::error::{Error, Result};
use crate::models::{
    AiUsage, Candidate, CandidateId, CandidateUpdate, DecisionLogEntry, Discussion, NewCandidate,
    NewTask, Nomination, PriorityClass, RateLimitRecord, RotationState, Source, SourceId, Tag,
    Task, TaskId, TaskStatus, Vote,
};

#[derive(Default)]
struct MemoryInner {
    candidates: Vec<Candidate>,
    sources: Vec<Source>,
    tags: Vec<Tag>,
    tag_sources: Vec<(i64, SourceId)>,
    votes: Vec<Vote>,
    nominations: Vec<Nomination>,
    rotation: RotationState,
    decisions: Vec<DecisionLogEntry>,
    weights: BTreeMap<String, f64>,
    tasks: Vec<Task>,
    rate_limits: BTreeMap<String, RateLimitRecord>,
    discussions: Vec<(CandidateId, Discussion)>,
    ai_usage: Vec<AiUsage>,
    next_id: i64,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::not_found("task", id))
    }
}

/// Mock store backed by plain collections
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn inner(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory store unavailable",
            )));
        }
        self.inner
            .lock()
            .map_err(|_| Error::lock_poisoned("memory store"))
    }
}

impl CandidateRepository for MemoryStore {
    fn insert_candidate(&self, candidate: &NewCandidate) -> Result<CandidateId> {
        let mut inner = self.inner()?;
        let id = inner.next_id();
        inner.candidates.push(Candidate {
            id,
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            summary: candidate.summary.clone(),
            direct_score: candidate.direct_score,
            times_shown: 0,
            last_shown_at: None,
            feed_id: candidate.feed_id,
            content_vector: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    fn get_candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        let inner = self.inner()?;
        Ok(inner.candidates.iter().find(|c| c.id == id).cloned())
    }

    fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let inner = self.inner()?;
        let mut rows: Vec<Candidate> = inner
            .candidates
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();

        match query.order {
            CandidateOrder::Id => rows.sort_by_key(|c| c.id),
            CandidateOrder::TimesShownAsc => rows.sort_by_key(|c| (c.times_shown, c.id)),
            CandidateOrder::ScoreDesc => rows.sort_by(|a, b| {
                b.direct_score
                    .total_cmp(&a.direct_score)
                    .then(a.id.cmp(&b.id))
            }),
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn update_candidate(&self, id: CandidateId, update: &CandidateUpdate) -> Result<()> {
        let mut inner = self.inner()?;
        let candidate = inner
            .candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::not_found("candidate", id))?;

        if let Some(score) = update.direct_score {
            candidate.direct_score = score;
        }
        if let Some(times) = update.times_shown {
            candidate.times_shown = times;
        }
        if let Some(at) = update.last_shown_at {
            candidate.last_shown_at = Some(at);
        }
        if let Some(summary) = &update.summary {
            candidate.summary = Some(summary.clone());
        }
        Ok(())
    }

    fn count_candidates(&self) -> Result<usize> {
        Ok(self.inner()?.candidates.len())
    }
}

impl SourceRepository for MemoryStore {
    fn insert_source(&self, name: &str, kind: &str) -> Result<SourceId> {
        let mut inner = self.inner()?;
        let id = inner.next_id();
        inner.sources.push(Source {
            id,
            name: name.to_string(),
            kind: kind.to_string(),
            trust_score: Source::NEUTRAL_TRUST,
            avg_link_score: 0.0,
        });
        Ok(id)
    }

    fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        let inner = self.inner()?;
        Ok(inner.sources.iter().find(|s| s.id == id).cloned())
    }

    fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(self.inner()?.sources.clone())
    }

    fn update_source_scores(
        &self,
        id: SourceId,
        trust_score: f64,
        avg_link_score: f64,
    ) -> Result<()> {
        let mut inner = self.inner()?;
        let source = inner
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found("source", id))?;
        source.trust_score = trust_score;
        source.avg_link_score = avg_link_score;
        Ok(())
    }

    fn insert_tag(&self, name: &str) -> Result<i64> {
        let mut inner = self.inner()?;
        let id = inner.next_id();
        inner.tags.push(Tag {
            id,
            name: name.to_string(),
            score: 0.0,
        });
        Ok(id)
    }

    fn link_tag_source(&self, tag_id: i64, source_id: SourceId) -> Result<()> {
        let mut inner = self.inner()?;
        if !inner.tag_sources.contains(&(tag_id, source_id)) {
            inner.tag_sources.push((tag_id, source_id));
        }
        Ok(())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.inner()?.tags.clone())
    }

    fn tag_source_ids(&self, tag_id: i64) -> Result<Vec<SourceId>> {
        let inner = self.inner()?;
        let mut ids: Vec<SourceId> = inner
            .tag_sources
            .iter()
            .filter(|(t, _)| *t == tag_id)
            .map(|(_, s)| *s)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn update_tag_score(&self, tag_id: i64, score: f64) -> Result<()> {
        let mut inner = self.inner()?;
        if let Some(tag) = inner.tags.iter_mut().find(|t| t.id == tag_id) {
            tag.score = score;
        }
        Ok(())
    }
}

impl FeedbackRepository for MemoryStore {
    fn record_vote(&self, vote: &Vote) -> Result<()> {
        self.inner()?.votes.push(vote.clone());
        Ok(())
    }

    fn votes_since(&self, candidate_id: CandidateId, since: DateTime<Utc>) -> Result<Vec<Vote>> {
        let inner = self.inner()?;
        Ok(inner
            .votes
            .iter()
            .filter(|v| v.candidate_id == candidate_id && v.created_at >= since)
            .cloned()
            .collect())
    }

    fn vote_kinds_since(&self, since: DateTime<Utc>) -> Result<Vec<(Option<String>, i8)>> {
        let inner = self.inner()?;
        let kind_of = |candidate_id: CandidateId| {
            let feed_id = inner
                .candidates
                .iter()
                .find(|c| c.id == candidate_id)
                .and_then(|c| c.feed_id)?;
            inner
                .sources
                .iter()
                .find(|s| s.id == feed_id)
                .map(|s| s.kind.clone())
        };
        Ok(inner
            .votes
            .iter()
            .filter(|v| v.created_at >= since)
            .map(|v| (kind_of(v.candidate_id), v.value))
            .collect())
    }

    fn vote_totals(&self) -> Result<BTreeMap<CandidateId, i64>> {
        let inner = self.inner()?;
        let mut totals = BTreeMap::new();
        for vote in &inner.votes {
            *totals.entry(vote.candidate_id).or_insert(0) += i64::from(vote.value);
        }
        Ok(totals)
    }

    fn add_nomination(&self, nomination: &Nomination) -> Result<()> {
        self.inner()?.nominations.push(nomination.clone());
        Ok(())
    }

    fn nominations_for(&self, rotation_id: &str) -> Result<Vec<Nomination>> {
        let inner = self.inner()?;
        Ok(inner
            .nominations
            .iter()
            .filter(|n| n.rotation_id == rotation_id)
            .cloned()
            .collect())
    }

    fn clear_nominations(&self, rotation_id: &str) -> Result<usize> {
        let mut inner = self.inner()?;
        let before = inner.nominations.len();
        inner.nominations.retain(|n| n.rotation_id != rotation_id);
        Ok(before - inner.nominations.len())
    }
}

impl RotationRepository for MemoryStore {
    fn load_rotation(&self) -> Result<RotationState> {
        Ok(self.inner()?.rotation.clone())
    }

    fn save_rotation(&self, state: &RotationState) -> Result<()> {
        self.inner()?.rotation = state.clone();
        Ok(())
    }

    fn set_rotation_ends_at(&self, ends_at: DateTime<Utc>) -> Result<()> {
        self.inner()?.rotation.rotation_ends_at = Some(ends_at);
        Ok(())
    }

    fn rotation_row_count(&self) -> Result<usize> {
        self.inner()?;
        Ok(1)
    }

    fn append_decision(&self, entry: &DecisionLogEntry) -> Result<()> {
        self.inner()?.decisions.push(entry.clone());
        Ok(())
    }

    fn recent_shown_ids(&self, n: usize) -> Result<Vec<CandidateId>> {
        let inner = self.inner()?;
        let mut ordered: Vec<&DecisionLogEntry> = inner.decisions.iter().collect();
        // Stable sort keeps insertion order among equal timestamps; reversing
        // afterwards puts the newest first.
        ordered.sort_by_key(|d| d.selected_at);
        let mut ids = Vec::new();
        for entry in ordered.into_iter().rev() {
            if ids.len() >= n {
                break;
            }
            if !ids.contains(&entry.candidate_id) {
                ids.push(entry.candidate_id);
            }
        }
        Ok(ids)
    }

    fn recent_decisions(&self, n: usize) -> Result<Vec<DecisionLogEntry>> {
        let inner = self.inner()?;
        let mut ordered: Vec<DecisionLogEntry> = inner.decisions.clone();
        ordered.sort_by_key(|d| d.selected_at);
        Ok(ordered.into_iter().rev().take(n).collect())
    }
}

impl TaskQueue for MemoryStore {
    fn enqueue(&self, task: &NewTask) -> Result<Option<TaskId>> {
        let mut inner = self.inner()?;
        let duplicate = inner.tasks.iter().any(|t| {
            t.candidate_id == task.candidate_id
                && t.task_type == task.task_type
                && t.status.is_active()
        });
        if duplicate {
            return Ok(None);
        }

        let id = inner.next_id();
        inner.tasks.push(Task {
            id,
            candidate_id: task.candidate_id,
            task_type: task.task_type,
            priority_class: task.priority_class,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: task.created_at,
            updated_at: task.created_at,
        });
        Ok(Some(id))
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let inner = self.inner()?;
        Ok(inner.tasks.iter().find(|t| t.id == id).cloned())
    }

    fn next_pending(&self, class: PriorityClass) -> Result<Option<Task>> {
        let inner = self.inner()?;
        Ok(inner
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.priority_class == class)
            .min_by_key(|t| (t.created_at, t.id))
            .cloned())
    }

    fn claim(&self, id: TaskId) -> Result<bool> {
        let mut inner = self.inner()?;
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.attempts += 1;
        task.updated_at = Utc::now();
        Ok(true)
    }

    fn mark_done(&self, id: TaskId) -> Result<()> {
        let mut inner = self.inner()?;
        let task = inner.task_mut(id)?;
        task.status = TaskStatus::Done;
        task.last_error = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    fn mark_failed(&self, id: TaskId, error: &str, max_attempts: u32) -> Result<TaskStatus> {
        let mut inner = self.inner()?;
        let task = inner.task_mut(id)?;
        task.status = if task.attempts >= max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        task.last_error = Some(truncate_error(error));
        task.updated_at = Utc::now();
        Ok(task.status)
    }

    fn release(&self, id: TaskId) -> Result<bool> {
        let mut inner = self.inner()?;
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::InProgress {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.attempts = task.attempts.saturating_sub(1);
        task.updated_at = Utc::now();
        Ok(true)
    }

    fn reset_in_progress(&self) -> Result<usize> {
        let mut inner = self.inner()?;
        let now = Utc::now();
        let mut reset = 0;
        for task in inner
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Pending;
            task.updated_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    fn queue_counts(&self) -> Result<QueueCounts> {
        let inner = self.inner()?;
        let mut counts = QueueCounts::default();
        for task in &inner.tasks {
            *counts
                .by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }
}

impl RateLimitRepository for MemoryStore {
    fn get_rate_limit(&self, api_name: &str) -> Result<Option<RateLimitRecord>> {
        Ok(self.inner()?.rate_limits.get(api_name).cloned())
    }

    fn put_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        self.inner()?
            .rate_limits
            .insert(record.api_name.clone(), record.clone());
        Ok(())
    }

    fn list_rate_limits(&self) -> Result<Vec<RateLimitRecord>> {
        Ok(self.inner()?.rate_limits.values().cloned().collect())
    }
}

impl SettingsRepository for MemoryStore {
    fn score_weights(&self) -> Result<Vec<(String, f64)>> {
        let inner = self.inner()?;
        Ok(inner
            .weights
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    fn set_score_weight(&self, key: &str, value: f64) -> Result<()> {
        self.inner()?.weights.insert(key.to_string(), value);
        Ok(())
    }
}

impl EnrichmentRepository for MemoryStore {
    fn save_discussions(
        &self,
        candidate_id: CandidateId,
        platform: &str,
        discussions: &[Discussion],
    ) -> Result<usize> {
        let mut inner = self.inner()?;
        inner
            .discussions
            .retain(|(id, d)| !(*id == candidate_id && d.platform == platform));
        for d in discussions {
            let mut d = d.clone();
            d.platform = platform.to_string();
            inner.discussions.push((candidate_id, d));
        }
        Ok(discussions.len())
    }

    fn discussions_for(&self, candidate_id: CandidateId) -> Result<Vec<Discussion>> {
        let inner = self.inner()?;
        Ok(inner
            .discussions
            .iter()
            .filter(|(id, _)| *id == candidate_id)
            .map(|(_, d)| d.clone())
            .collect())
    }

    fn record_ai_usage(&self, usage: &AiUsage) -> Result<()> {
        self.inner()?.ai_usage.push(usage.clone());
        Ok(())
    }

    fn ai_spend_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let inner = self.inner()?;
        Ok(inner
            .ai_usage
            .iter()
            .filter(|u| u.created_at >= since)
            .map(|u| u.cost_usd)
            .sum())
    }
}
