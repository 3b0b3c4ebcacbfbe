//! Priority worker: ordering, deferral, budget and retry behaviour

use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use linksite::config::WorkerConfig;
use linksite::error::EnrichError;
use linksite::models::{Candidate, NewTask, PriorityClass, Task, TaskStatus, TaskType};
use linksite::ratelimit::BackoffStore;
use linksite::storage::{create_memory_store, MemoryStore, SharedStore};
use linksite::worker::{DeferReason, TaskExecutor, TaskOutput, WorkerAction};

use super::fixtures::{
    add_candidate, sqlite_store, t0, worker, worker_with, FakeLookup, FakeSummarizer,
};

fn enqueue(store: &SharedStore, title: &str, task_type: TaskType, class: PriorityClass) -> i64 {
    let candidate = add_candidate(store, title);
    store
        .enqueue(&NewTask::new(candidate, task_type, class).at(t0()))
        .unwrap()
        .unwrap()
}

fn status(store: &SharedStore, task_id: i64) -> TaskStatus {
    store.get_task(task_id).unwrap().unwrap().status
}

#[tokio::test]
async fn test_higher_priority_class_runs_first() {
    let (store, _dir) = sqlite_store();
    let backlog = enqueue(&store, "old", TaskType::HnDiscussions, PriorityClass::Backlog);
    let urgent = enqueue(&store, "hot", TaskType::HnDiscussions, PriorityClass::ReverseLookup);
    let hn = FakeLookup::new(TaskType::HnDiscussions, false);
    let worker = worker(store.clone()).with_executor(hn.clone());

    let first = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(first, WorkerAction::Completed { task_id, .. } if task_id == urgent));
    assert_eq!(status(&store, backlog), TaskStatus::Pending);

    let second = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(second, WorkerAction::Completed { task_id, .. } if task_id == backlog));

    assert_eq!(worker.tick_at(t0()).await.result.unwrap(), WorkerAction::Idle);
    assert_eq!(hn.calls(), 2);
}

#[tokio::test]
async fn test_oldest_task_within_a_class_first() {
    let store = create_memory_store();
    let a = add_candidate(&store, "a");
    let b = add_candidate(&store, "b");
    let newer = store
        .enqueue(
            &NewTask::new(a, TaskType::HnDiscussions, PriorityClass::Backlog)
                .at(t0() + Duration::minutes(5)),
        )
        .unwrap()
        .unwrap();
    let older = store
        .enqueue(&NewTask::new(b, TaskType::HnDiscussions, PriorityClass::Backlog).at(t0()))
        .unwrap()
        .unwrap();

    let worker =
        worker(store.clone()).with_executor(FakeLookup::new(TaskType::HnDiscussions, false));
    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { task_id, .. } if task_id == older));
    assert_eq!(status(&store, newer), TaskStatus::Pending);
}

#[tokio::test]
async fn test_backing_off_api_does_not_block_other_classes() {
    let (store, _dir) = sqlite_store();
    let reddit_task = enqueue(
        &store,
        "r",
        TaskType::RedditDiscussions,
        PriorityClass::UserSubmitted,
    );
    let hn_task = enqueue(&store, "h", TaskType::HnDiscussions, PriorityClass::Backlog);

    BackoffStore::new(store.clone())
        .record_failure_at("reddit", "429 too many requests", t0())
        .unwrap();

    let reddit = FakeLookup::new(TaskType::RedditDiscussions, false);
    let hn = FakeLookup::new(TaskType::HnDiscussions, false);
    let worker = worker(store.clone())
        .with_executor(reddit.clone())
        .with_executor(hn.clone());

    let action = worker.tick_at(t0() + Duration::seconds(10)).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { task_id, .. } if task_id == hn_task));
    assert_eq!(reddit.calls(), 0);
    assert_eq!(status(&store, reddit_task), TaskStatus::Pending);

    // Only the reddit task is left and its API is still cooling down
    match worker.tick_at(t0() + Duration::seconds(20)).await.result.unwrap() {
        WorkerAction::Deferred(deferrals) => {
            assert_eq!(deferrals.len(), 1);
            assert_eq!(deferrals[0].task_id, reddit_task);
            assert_eq!(deferrals[0].reason, DeferReason::BackingOff);
        }
        other => panic!("unexpected {other:?}"),
    }

    // One minute later the cooldown is over
    let action = worker.tick_at(t0() + Duration::seconds(61)).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { task_id, .. } if task_id == reddit_task));
    let record = store.get_rate_limit("reddit").unwrap().unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.backoff_until.is_none());
}

#[tokio::test]
async fn test_failures_retry_until_attempts_are_exhausted() {
    let store = create_memory_store();
    let task_id = enqueue(&store, "flaky", TaskType::HnDiscussions, PriorityClass::Backlog);
    let hn = FakeLookup::new(TaskType::HnDiscussions, true);
    let worker = worker(store.clone()).with_executor(hn.clone());

    // Ticks spaced past each cooldown: 1, 5 minutes
    let first = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(first, WorkerAction::Requeued { attempts: 1, .. }));

    let second = worker.tick_at(t0() + Duration::minutes(2)).await.result.unwrap();
    assert!(matches!(second, WorkerAction::Requeued { attempts: 2, .. }));

    let third = worker.tick_at(t0() + Duration::minutes(8)).await.result.unwrap();
    assert!(matches!(third, WorkerAction::Dead { task_id: id, .. } if id == task_id));

    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.last_error.unwrap().contains("502"));
    assert_eq!(hn.calls(), 3);

    let record = store.get_rate_limit("hn").unwrap().unwrap();
    assert_eq!(record.consecutive_failures, 3);
    assert_eq!(
        record.backoff_until,
        Some(t0() + Duration::minutes(8) + Duration::minutes(30))
    );
}

#[tokio::test]
async fn test_summary_saved_and_cost_recorded() {
    let (store, _dir) = sqlite_store();
    let task_id = enqueue(&store, "paper", TaskType::Summarize, PriorityClass::RecentlyIngested);
    let summarizer = FakeSummarizer::new(
        "A paper on scheduling fairness across many independent queues.",
        0.0125,
    );
    let worker = worker(store.clone()).with_executor(summarizer.clone());

    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { .. }));

    let task = store.get_task(task_id).unwrap().unwrap();
    let candidate = store.get_candidate(task.candidate_id).unwrap().unwrap();
    assert!(candidate.summary.unwrap().starts_with("A paper on scheduling"));
    assert!((worker.budget().spent_at(t0()).unwrap() - 0.0125).abs() < 1e-9);
}

#[tokio::test]
async fn test_too_short_summary_is_a_failure_but_still_costs() {
    let store = create_memory_store();
    let task_id = enqueue(&store, "x", TaskType::Summarize, PriorityClass::RecentlyIngested);
    let worker = worker(store.clone()).with_executor(FakeSummarizer::new("Nope.", 0.01));

    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Requeued { .. }));
    assert_eq!(status(&store, task_id), TaskStatus::Pending);
    assert!(store.get_rate_limit("anthropic").unwrap().unwrap().backoff_until.is_some());
    assert!((worker.budget().spent_at(t0()).unwrap() - 0.01).abs() < 1e-9);
}

#[tokio::test]
async fn test_exhausted_budget_defers_only_metered_work() {
    let store = create_memory_store();
    let summary_task = enqueue(&store, "s", TaskType::Summarize, PriorityClass::ReverseLookup);
    let lookup_task = enqueue(&store, "l", TaskType::HnDiscussions, PriorityClass::Backlog);

    let summarizer = FakeSummarizer::new("More than twenty characters of summary.", 0.6);
    let config = WorkerConfig {
        monthly_budget_usd: 0.5,
        ..WorkerConfig::default()
    };
    let worker = worker_with(store.clone(), config)
        .with_executor(summarizer.clone())
        .with_executor(FakeLookup::new(TaskType::HnDiscussions, false));

    // Under budget: the summary runs and overshoots the limit
    let first = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(first, WorkerAction::Completed { task_id, .. } if task_id == summary_task));

    let second_summary =
        enqueue(&store, "s2", TaskType::Summarize, PriorityClass::ReverseLookup);
    let second = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(second, WorkerAction::Completed { task_id, .. } if task_id == lookup_task));
    assert_eq!(status(&store, second_summary), TaskStatus::Pending);

    match worker.tick_at(t0()).await.result.unwrap() {
        WorkerAction::Deferred(deferrals) => {
            assert_eq!(deferrals[0].reason, DeferReason::OverBudget);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(summarizer.calls(), 1);
}

#[tokio::test]
async fn test_rate_limit_defers_after_quota() {
    use linksite::broadcast::NoopBroadcaster;
    use linksite::ratelimit::{ApiGate, RequestLimiter};
    use linksite::worker::PriorityWorker;

    let store = create_memory_store();
    for i in 0..3 {
        enqueue(&store, &format!("q{i}"), TaskType::HnDiscussions, PriorityClass::Backlog);
    }
    let gate = ApiGate::new(
        BackoffStore::new(store.clone()),
        RequestLimiter::new([("hn", 2)]),
    );
    let worker = PriorityWorker::new(
        store.clone(),
        gate,
        Arc::new(NoopBroadcaster),
        WorkerConfig::default(),
    )
    .with_executor(FakeLookup::new(TaskType::HnDiscussions, false));

    for _ in 0..2 {
        let action = worker.tick_at(t0()).await.result.unwrap();
        assert!(matches!(action, WorkerAction::Completed { .. }));
    }
    match worker.tick_at(t0()).await.result.unwrap() {
        WorkerAction::Deferred(deferrals) => {
            assert_eq!(deferrals[0].reason, DeferReason::RateLimited);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_storage_outage_is_reported_and_recovers() {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let task_id = enqueue(&store, "a", TaskType::HnDiscussions, PriorityClass::Backlog);
    let worker =
        worker(store.clone()).with_executor(FakeLookup::new(TaskType::HnDiscussions, false));

    memory.set_unavailable(true);
    let outcome = worker.tick_at(t0()).await;
    assert!(outcome.result.is_err());
    assert_eq!(outcome.next_delay, std::time::Duration::from_secs(10));

    memory.set_unavailable(false);
    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { task_id: id, .. } if id == task_id));
}

/// Lookup that takes the store down while its first call is in flight
struct OutageDuringLookup {
    memory: Arc<MemoryStore>,
    inner: Arc<FakeLookup>,
    tripped: AtomicBool,
}

#[async_trait]
impl TaskExecutor for OutageDuringLookup {
    fn task_type(&self) -> TaskType {
        TaskType::HnDiscussions
    }

    async fn execute(
        &self,
        task: &Task,
        candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.memory.set_unavailable(true);
        }
        self.inner.execute(task, candidate).await
    }
}

#[tokio::test]
async fn test_storage_outage_mid_task_releases_the_claim() {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let task_id = enqueue(&store, "a", TaskType::HnDiscussions, PriorityClass::Backlog);
    let inner = FakeLookup::new(TaskType::HnDiscussions, false);
    let worker = worker(store.clone()).with_executor(Arc::new(OutageDuringLookup {
        memory: memory.clone(),
        inner: inner.clone(),
        tripped: AtomicBool::new(false),
    }));

    // Claimed, executed, then every write fails
    let outcome = worker.tick_at(t0()).await;
    assert!(outcome.result.is_err());
    memory.set_unavailable(false);
    assert_eq!(status(&store, task_id), TaskStatus::InProgress);

    // Released and retried from scratch once the store is back
    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { task_id: id, .. } if id == task_id));
    assert_eq!(inner.calls(), 2);

    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.attempts, 1);
    assert_eq!(store.discussions_for(task.candidate_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_recovers_interrupted_tasks_and_stops() {
    let (store, _dir) = sqlite_store();
    let task_id = enqueue(&store, "a", TaskType::HnDiscussions, PriorityClass::Backlog);
    assert!(store.claim(task_id).unwrap());

    let worker =
        worker(store.clone()).with_executor(FakeLookup::new(TaskType::HnDiscussions, false));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(status(&store, task_id), TaskStatus::Done);
}
