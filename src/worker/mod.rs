//! Priority enrichment worker
//!
//! Drains the task queue one task per tick. Classes are visited in priority
//! order (reverse lookup, user submitted, recently ingested, backlog); within
//! a class the oldest pending task is the only candidate. A task whose API is
//! backing off or rate limited, or whose metered work is over budget, stays
//! pending and the next class is tried instead.
//!
//! Task lifecycle:
//!
//! ```text
//! pending → in_progress → done
//!                       → pending   (failed, attempts left)
//!                       → failed    (failed, attempts exhausted or not retryable)
//!                       → pending   (storage error, attempt not counted)
//! ```

pub mod anthropic;
pub mod budget;
pub mod discussions;
pub mod executor;

pub use anthropic::AnthropicSummarizer;
pub use budget::{month_start, BudgetGuard};
pub use discussions::{HackerNewsLookup, RedditLookup};
pub use executor::{TaskExecutor, TaskOutput};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;

use crate::broadcast::{Event, EventBroadcaster};
use crate::config::{Config, WorkerConfig};
use crate::error::{EnrichError, Error, LinksiteErrorTrait, Result};
use crate::metrics;
use crate::models::{CandidateUpdate, PriorityClass, Task, TaskId, TaskStatus, TaskType};
use crate::ratelimit::{ApiGate, GateDecision};
use crate::storage::SharedStore;

// ============================================================================
// Tick results
// ============================================================================

/// Why a pending task was left for a later tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    OverBudget,
    BackingOff,
    RateLimited,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OverBudget => "over_budget",
            Self::BackingOff => "backing_off",
            Self::RateLimited => "rate_limited",
        }
    }

    /// `None` when the gate is open
    pub fn from_gate(decision: GateDecision) -> Option<Self> {
        match decision {
            GateDecision::Open => None,
            GateDecision::BackingOff => Some(Self::BackingOff),
            GateDecision::RateLimited => Some(Self::RateLimited),
        }
    }
}

/// A task skipped this tick
#[derive(Debug, Clone, PartialEq)]
pub struct Deferral {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub priority_class: PriorityClass,
    pub reason: DeferReason,
}

/// What one worker tick did
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    /// Queue empty
    Idle,
    /// Pending work exists but none of it may run now
    Deferred(Vec<Deferral>),
    Completed {
        task_id: TaskId,
        task_type: TaskType,
    },
    /// Failed, will be retried
    Requeued {
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
    /// Failed for the last time
    Dead { task_id: TaskId, error: String },
}

/// Result of a worker tick plus the delay before the next one
#[derive(Debug)]
pub struct WorkerTickOutcome {
    pub result: Result<WorkerAction>,
    pub next_delay: std::time::Duration,
}

// ============================================================================
// Worker
// ============================================================================

/// Single-task-per-tick queue consumer
pub struct PriorityWorker {
    store: SharedStore,
    gate: ApiGate,
    budget: BudgetGuard,
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
    broadcaster: Arc<dyn EventBroadcaster>,
    config: WorkerConfig,
    /// Claimed tasks a failed tick could not hand back yet
    stranded: Mutex<Vec<TaskId>>,
}

impl PriorityWorker {
    pub fn new(
        store: SharedStore,
        gate: ApiGate,
        broadcaster: Arc<dyn EventBroadcaster>,
        config: WorkerConfig,
    ) -> Self {
        let budget = BudgetGuard::new(store.clone(), config.monthly_budget_usd);
        Self {
            store,
            gate,
            budget,
            executors: HashMap::new(),
            broadcaster,
            config,
            stranded: Mutex::new(Vec::new()),
        }
    }

    /// Worker with the gate and every executor the configuration allows.
    ///
    /// Summaries are only registered when an Anthropic key is present.
    pub fn from_config(
        store: SharedStore,
        broadcaster: Arc<dyn EventBroadcaster>,
        config: &Config,
    ) -> Result<Self> {
        let timeout = config.task_timeout();
        let gate = ApiGate::from_config(store.clone(), &config.apis);
        let mut worker = Self::new(store, gate, broadcaster, config.worker.clone());

        worker.register(Arc::new(HackerNewsLookup::new(&config.apis.hn, timeout)?));
        worker.register(Arc::new(RedditLookup::new(&config.apis.reddit, timeout)?));
        match AnthropicSummarizer::new(&config.apis.anthropic, timeout) {
            Ok(summarizer) => worker.register(Arc::new(summarizer)),
            Err(EnrichError::MissingApiKey(api)) => {
                tracing::warn!(api, "No API key configured, summaries disabled")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(worker)
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.task_type(), executor);
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn has_executor(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// Return tasks left `in_progress` by a previous process to `pending`
    pub fn recover(&self) -> Result<usize> {
        let reset = self.store.reset_in_progress()?;
        if reset > 0 {
            tracing::warn!(reset, "Requeued tasks interrupted by a previous run");
        }
        Ok(reset)
    }

    pub async fn tick(&self) -> WorkerTickOutcome {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick. Errors are logged and returned, never raised.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> WorkerTickOutcome {
        let result = self.try_tick(now).await;

        if let Err(e) = &result {
            tracing::error!(
                error = %e,
                category = %e.category(),
                recoverable = e.is_recoverable(),
                "Worker tick failed"
            );
            metrics::record_tick_error("worker", e.category().as_str());
        }

        WorkerTickOutcome {
            result,
            next_delay: self.config.tick_interval(),
        }
    }

    async fn try_tick(&self, now: DateTime<Utc>) -> Result<WorkerAction> {
        self.release_stranded()?;
        let mut deferred = Vec::new();

        for class in PriorityClass::ORDER {
            let Some(task) = self.store.next_pending(class)? else {
                continue;
            };

            if let Some(reason) = self.blocked(&task, now)? {
                tracing::debug!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    class = %class,
                    reason = reason.as_str(),
                    "Deferring task"
                );
                deferred.push(Deferral {
                    task_id: task.id,
                    task_type: task.task_type,
                    priority_class: class,
                    reason,
                });
                continue;
            }

            if !self.store.claim(task.id)? {
                continue;
            }
            let task_id = task.id;
            let result = self.process(task, now).await;
            if result.is_err() {
                self.release_claim(task_id);
            }
            return result;
        }

        if deferred.is_empty() {
            Ok(WorkerAction::Idle)
        } else {
            Ok(WorkerAction::Deferred(deferred))
        }
    }

    /// Put a claimed task back to pending after a storage error. When the
    /// store refuses that too, the task is remembered and released at the
    /// start of a later tick.
    fn release_claim(&self, task_id: TaskId) {
        match self.store.release(task_id) {
            Ok(released) => tracing::warn!(task_id, released, "Claim released after failed tick"),
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Could not release claim, will retry");
                match self.stranded.lock() {
                    Ok(mut stranded) => stranded.push(task_id),
                    Err(_) => tracing::error!(task_id, "Stranded task list lock poisoned"),
                }
            }
        }
    }

    fn release_stranded(&self) -> Result<()> {
        let mut stranded = self
            .stranded
            .lock()
            .map_err(|_| Error::lock_poisoned("stranded tasks"))?;
        while let Some(&task_id) = stranded.last() {
            let released = self.store.release(task_id)?;
            stranded.pop();
            tracing::info!(task_id, released, "Released task stranded by an earlier tick");
        }
        Ok(())
    }

    /// Budget first, then the API gate (which consumes quota when open)
    fn blocked(&self, task: &Task, now: DateTime<Utc>) -> Result<Option<DeferReason>> {
        if task.task_type.is_metered() && !self.budget.allows_at(now)? {
            return Ok(Some(DeferReason::OverBudget));
        }
        let Some(executor) = self.executors.get(&task.task_type) else {
            return Ok(None);
        };
        Ok(DeferReason::from_gate(
            self.gate.permit_at(executor.api_name(), now)?,
        ))
    }

    async fn process(&self, task: Task, now: DateTime<Utc>) -> Result<WorkerAction> {
        // claim() bumped the stored counter
        let attempts = task.attempts + 1;

        let Some(executor) = self.executors.get(&task.task_type).cloned() else {
            let error = EnrichError::Unsupported(task.task_type.to_string()).to_string();
            self.store.mark_failed(task.id, &error, 0)?;
            self.finish(&task, false, "unsupported", 0.0);
            return Ok(WorkerAction::Dead {
                task_id: task.id,
                error,
            });
        };

        let Some(candidate) = self.store.get_candidate(task.candidate_id)? else {
            let error = format!("candidate {} not found", task.candidate_id);
            self.store.mark_failed(task.id, &error, 0)?;
            self.finish(&task, false, "missing_candidate", 0.0);
            return Ok(WorkerAction::Dead {
                task_id: task.id,
                error,
            });
        };

        let api = executor.api_name();
        let started = Instant::now();
        let timeout = self.config.task_timeout();
        let execution = tokio::time::timeout(timeout, executor.execute(&task, &candidate));
        let outcome = match execution.await {
            Ok(result) => result,
            Err(_) => Err(EnrichError::Timeout(timeout.as_secs())),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match outcome {
            Ok(output) => {
                if let Some(usage) = output.usage() {
                    let mut usage = usage.clone();
                    usage.created_at = now;
                    self.store.record_ai_usage(&usage)?;
                }
                output.validate().map(|()| output)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                self.gate.backoff().record_success_at(api, now)?;
                self.persist(&task, output)?;
                self.store.mark_done(task.id)?;
                self.finish(&task, true, "completed", elapsed);
                tracing::info!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    candidate_id = task.candidate_id,
                    "Task completed"
                );
                Ok(WorkerAction::Completed {
                    task_id: task.id,
                    task_type: task.task_type,
                })
            }
            Err(e) => {
                let error = e.to_string();
                // Errors a retry cannot fix neither back off the API nor wait
                // for the remaining attempts
                let max_attempts = if e.is_recoverable() {
                    self.gate.backoff().record_failure_at(api, &error, now)?;
                    self.config.max_attempts
                } else {
                    0
                };
                let status = self.store.mark_failed(task.id, &error, max_attempts)?;

                if status == TaskStatus::Failed {
                    self.finish(&task, false, "dead", elapsed);
                    tracing::error!(
                        task_id = task.id,
                        task_type = %task.task_type,
                        attempts,
                        error = %error,
                        "Task failed permanently"
                    );
                    Ok(WorkerAction::Dead {
                        task_id: task.id,
                        error,
                    })
                } else {
                    metrics::record_task(task.task_type.as_str(), "requeued", elapsed);
                    tracing::warn!(
                        task_id = task.id,
                        task_type = %task.task_type,
                        attempts,
                        error = %error,
                        "Task failed, will retry"
                    );
                    Ok(WorkerAction::Requeued {
                        task_id: task.id,
                        attempts,
                        error,
                    })
                }
            }
        }
    }

    fn persist(&self, task: &Task, output: TaskOutput) -> Result<()> {
        match output {
            TaskOutput::Summary { text, .. } => self
                .store
                .update_candidate(task.candidate_id, &CandidateUpdate::summary(text)),
            TaskOutput::Discussions { platform, items } => {
                let saved = self
                    .store
                    .save_discussions(task.candidate_id, &platform, &items)?;
                tracing::debug!(
                    candidate_id = task.candidate_id,
                    platform = %platform,
                    saved,
                    "Discussions saved"
                );
                Ok(())
            }
        }
    }

    /// Metrics and the completion event for a task that left the queue
    fn finish(&self, task: &Task, success: bool, outcome: &str, elapsed: f64) {
        metrics::record_task(task.task_type.as_str(), outcome, elapsed);
        self.broadcaster.broadcast(Event::TaskFinished {
            task_id: task.id,
            candidate_id: task.candidate_id,
            task_type: task.task_type,
            success,
        });
    }

    /// Tick until `shutdown` turns true. An in-flight tick always finishes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover() {
            tracing::error!(error = %e, "Failed to recover interrupted tasks");
        }
        tracing::info!(
            interval_secs = self.config.tick_interval_secs,
            executors = self.executors.len(),
            "Worker loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = self.tick().await.next_delay;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Worker loop stopped");
    }
}
