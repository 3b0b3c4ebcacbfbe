//! Shared stores, clocks and fake executors for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use linksite::broadcast::NoopBroadcaster;
use linksite::config::{DirectorConfig, WeightKey, WorkerConfig};
use linksite::director::Director;
use linksite::error::EnrichError;
use linksite::models::{AiUsage, Candidate, CandidateId, Discussion, NewCandidate, Task, TaskType};
use linksite::ratelimit::{ApiGate, BackoffStore, RequestLimiter};
use linksite::storage::{create_sqlite_store, SharedStore};
use linksite::worker::{PriorityWorker, TaskExecutor, TaskOutput};

/// Fixed reference instant
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap()
}

/// SQLite store in a temporary directory; keep the `TempDir` alive
pub fn sqlite_store() -> (SharedStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = create_sqlite_store(dir.path().join("linksite.db")).unwrap();
    (store, dir)
}

pub fn add_candidate(store: &SharedStore, title: &str) -> CandidateId {
    store
        .insert_candidate(&NewCandidate::new(title, format!("https://{title}.example/")))
        .unwrap()
}

pub fn add_candidates(store: &SharedStore, n: usize) -> Vec<CandidateId> {
    (0..n).map(|i| add_candidate(store, &format!("link{i}"))).collect()
}

pub fn set_weight(store: &SharedStore, key: WeightKey, value: f64) {
    store.set_score_weight(key.name(), value).unwrap();
}

pub fn director(store: SharedStore, seed: u64) -> Director {
    Director::new(
        store,
        Arc::new(NoopBroadcaster),
        DirectorConfig {
            seed: Some(seed),
            ..DirectorConfig::default()
        },
    )
}

// ============================================================================
// Fake executors
// ============================================================================

/// Discussion lookup that succeeds or fails on demand
pub struct FakeLookup {
    pub task_type: TaskType,
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl FakeLookup {
    pub fn new(task_type: TaskType, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for FakeLookup {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(
        &self,
        _task: &Task,
        candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EnrichError::Status {
                code: 502,
                body: "bad gateway".into(),
            });
        }
        let platform = self.task_type.api_name().to_string();
        Ok(TaskOutput::Discussions {
            platform: platform.clone(),
            items: vec![Discussion {
                platform,
                url: format!("{}#thread", candidate.url),
                title: candidate.title.clone(),
                score: 12,
                num_comments: 4,
            }],
        })
    }
}

/// Summarizer returning canned text and usage
pub struct FakeSummarizer {
    pub text: String,
    pub cost_usd: f64,
    pub calls: AtomicUsize,
}

impl FakeSummarizer {
    pub fn new(text: &str, cost_usd: f64) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            cost_usd,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for FakeSummarizer {
    fn task_type(&self) -> TaskType {
        TaskType::Summarize
    }

    async fn execute(
        &self,
        task: &Task,
        _candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutput::Summary {
            text: self.text.clone(),
            usage: Some(AiUsage {
                model: "fake".into(),
                input_tokens: 100,
                output_tokens: 50,
                cost_usd: self.cost_usd,
                candidate_id: Some(task.candidate_id),
                created_at: Utc::now(),
            }),
        })
    }
}

/// Worker over `store` with generous quotas and no executors
pub fn worker(store: SharedStore) -> PriorityWorker {
    worker_with(store, WorkerConfig::default())
}

pub fn worker_with(store: SharedStore, config: WorkerConfig) -> PriorityWorker {
    let gate = ApiGate::new(
        BackoffStore::new(store.clone()),
        RequestLimiter::new([("anthropic", 100), ("reddit", 100), ("hn", 100)]),
    );
    PriorityWorker::new(store, gate, Arc::new(NoopBroadcaster), config)
}
