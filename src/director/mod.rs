//! Rotation director
//!
//! Decides which candidate is on stage, for how long, and what is shown
//! around it. All state lives in the store and is re-read every tick; the
//! only in-process state is the selection RNG and the rotation counter that
//! paces score propagation.
//!
//! # Tick
//!
//! 1. No current candidate → rotate.
//! 2. `now >= rotation_ends_at` → rotate.
//! 3. Otherwise adjust the end time from votes cast since `started_at`, or
//!    rotate at once when a single user hits the downvote threshold.
//!
//! # Example
//!
//! ```ignore
//! use linksite::broadcast::NoopBroadcaster;
//! use linksite::config::DirectorConfig;
//! use linksite::director::Director;
//! use linksite::storage::create_memory_store;
//! use std::sync::Arc;
//!
//! let mut director = Director::new(
//!     create_memory_store(),
//!     Arc::new(NoopBroadcaster),
//!     DirectorConfig::default(),
//! );
//! let outcome = director.tick();
//! println!("{:?}, next tick in {:?}", outcome.result, outcome.next_delay);
//! ```

pub mod momentum;
pub mod propagation;
pub mod satellites;
pub mod selection;
pub mod timers;

pub use propagation::{propagate_scores, trust_from_average, PropagationReport};
pub use selection::Pool;
pub use timers::TimerDecision;

use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::broadcast::{CandidateRef, Event, EventBroadcaster};
use crate::config::{DirectorConfig, ScoreWeights};
use crate::error::{LinksiteErrorTrait, Result};
use crate::metrics;
use crate::models::{
    Candidate, CandidateId, CandidateUpdate, DecisionLogEntry, NewTask, PriorityClass,
    RotationState, SelectionReason, TaskType,
};
use crate::storage::SharedStore;

// ============================================================================
// Tick results
// ============================================================================

/// Why a rotation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    /// Nothing was on stage
    Initial,
    /// The rotation ran out of time (or was skipped)
    Expired,
    /// One user reached the downvote threshold
    DownvoteVeto,
}

/// What a completed rotation put on stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationSummary {
    pub candidate_id: CandidateId,
    pub reason: SelectionReason,
    pub trigger: RotationTrigger,
    pub satellites: usize,
    pub rotation_ends_at: DateTime<Utc>,
    /// Score propagation ran as part of this rotation
    pub propagated: bool,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickAction {
    Rotated(RotationSummary),
    /// The end time of the current rotation was rewritten
    TimerAdjusted { rotation_ends_at: DateTime<Utc> },
    /// Nothing to do
    Steady,
    /// A rotation was due but no candidate was eligible
    NoCandidate,
}

/// Result of a tick plus how long to wait before the next one
#[derive(Debug)]
pub struct TickOutcome {
    pub result: Result<TickAction>,
    pub next_delay: std::time::Duration,
}

impl TickOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn rotated(&self) -> Option<&RotationSummary> {
        match &self.result {
            Ok(TickAction::Rotated(summary)) => Some(summary),
            _ => None,
        }
    }
}

// ============================================================================
// Director
// ============================================================================

/// The rotation engine
pub struct Director {
    store: SharedStore,
    broadcaster: Arc<dyn EventBroadcaster>,
    config: DirectorConfig,
    rng: Box<dyn RngCore + Send>,
    rotation_count: u64,
}

impl Director {
    /// Build a director; the RNG is seeded from `config.seed` when set
    pub fn new(
        store: SharedStore,
        broadcaster: Arc<dyn EventBroadcaster>,
        config: DirectorConfig,
    ) -> Self {
        let rng: Box<dyn RngCore + Send> = match config.seed {
            Some(seed) => Box::new(ChaCha8Rng::seed_from_u64(seed)),
            None => Box::new(ChaCha8Rng::from_entropy()),
        };
        Self {
            store,
            broadcaster,
            config,
            rng,
            rotation_count: 0,
        }
    }

    /// Replace the selection RNG
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Completed rotations since this director was created
    pub fn rotation_count(&self) -> u64 {
        self.rotation_count
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Utc::now())
    }

    /// Run one tick. Errors are logged and returned, never raised.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let result = self.try_tick(now);

        let next_secs = match &result {
            Ok(TickAction::NoCandidate) => self.config.idle_backoff_secs,
            _ => self.config.tick_interval_secs,
        };
        let next_delay = std::time::Duration::from_secs(next_secs);

        if let Err(e) = &result {
            tracing::error!(
                error = %e,
                category = %e.category(),
                recoverable = e.is_recoverable(),
                "Director tick failed"
            );
            metrics::record_tick_error("director", e.category().as_str());
        }

        TickOutcome { result, next_delay }
    }

    fn try_tick(&mut self, now: DateTime<Utc>) -> Result<TickAction> {
        let weights = ScoreWeights::load(&*self.store)?;
        let state = self.store.load_rotation()?;

        if state.current_candidate_id.is_none() {
            return self.rotate_with(&state, &weights, now, RotationTrigger::Initial);
        }

        match (state.started_at, state.rotation_ends_at) {
            (Some(started_at), Some(ends_at)) if now < ends_at => {
                self.adjust_timers(&state, started_at, &weights, now)
            }
            _ => self.rotate_with(&state, &weights, now, RotationTrigger::Expired),
        }
    }

    fn adjust_timers(
        &mut self,
        state: &RotationState,
        started_at: DateTime<Utc>,
        weights: &ScoreWeights,
        now: DateTime<Utc>,
    ) -> Result<TickAction> {
        let Some(candidate_id) = state.current_candidate_id else {
            return Ok(TickAction::Steady);
        };

        let votes = self.store.votes_since(candidate_id, started_at)?;
        match timers::evaluate(started_at, state.rotation_ends_at, &votes, weights) {
            TimerDecision::Veto { user_id, downvotes } => {
                tracing::info!(
                    candidate_id,
                    user = %user_id,
                    downvotes,
                    "Downvote threshold reached, skipping"
                );
                metrics::record_downvote_veto();
                self.rotate_with(state, weights, now, RotationTrigger::DownvoteVeto)
            }
            TimerDecision::Adjust { rotation_ends_at } => {
                self.store.set_rotation_ends_at(rotation_ends_at)?;
                metrics::record_timer_adjustment();
                tracing::debug!(candidate_id, %rotation_ends_at, "Rotation end adjusted");
                Ok(TickAction::TimerAdjusted { rotation_ends_at })
            }
            TimerDecision::Unchanged => Ok(TickAction::Steady),
        }
    }

    /// Force a rotation now regardless of the current timers
    pub fn rotate_at(&mut self, now: DateTime<Utc>) -> Result<TickAction> {
        let weights = ScoreWeights::load(&*self.store)?;
        let state = self.store.load_rotation()?;
        self.rotate_with(&state, &weights, now, RotationTrigger::Expired)
    }

    fn rotate_with(
        &mut self,
        outgoing: &RotationState,
        weights: &ScoreWeights,
        now: DateTime<Utc>,
        trigger: RotationTrigger,
    ) -> Result<TickAction> {
        let nominated = match outgoing.epoch() {
            Some(epoch) => {
                let nominations = self.store.nominations_for(&epoch)?;
                let winner = satellites::nomination_winner(&nominations, &outgoing.satellites);
                let cleared = self.store.clear_nominations(&epoch)?;
                if cleared > 0 {
                    tracing::debug!(epoch = %epoch, cleared, "Cleared nominations");
                }
                winner
            }
            None => None,
        };

        let momentum = momentum::compute_momentum(&*self.store, now, weights)?;
        let fatigue = momentum::fatigue_list(&*self.store, weights)?;

        let mut picked: Option<(Candidate, SelectionReason)> = None;
        if let Some((candidate_id, count)) = nominated {
            match self.store.get_candidate(candidate_id)? {
                Some(candidate) => {
                    tracing::info!(candidate_id, nominations = count, "Nomination winner");
                    picked = Some((candidate, SelectionReason::Nominated));
                }
                None => tracing::warn!(candidate_id, "Nominated candidate no longer exists"),
            }
        }
        if picked.is_none() {
            let pool = selection::pick_pool(&mut *self.rng, weights.pool_weights());
            tracing::debug!(?pool, "Pool chosen");
            picked =
                selection::select_from_pool(&*self.store, &mut *self.rng, pool, &fatigue, now)?;
        }

        let Some((candidate, reason)) = picked else {
            tracing::warn!("No eligible candidates to rotate to");
            return Ok(TickAction::NoCandidate);
        };

        let sats = satellites::generate_satellites(
            &*self.store,
            &mut *self.rng,
            candidate.id,
            &fatigue,
            weights,
            now,
        )?;

        let duration = weights.rotation_default();
        let rotation_ends_at = now + duration;
        let reveal_ends_at = now + weights.reveal_interval() * weights.satellite_count() as i32;
        let satellite_total = sats.len();

        self.store.save_rotation(&RotationState {
            current_candidate_id: Some(candidate.id),
            started_at: Some(now),
            rotation_ends_at: Some(rotation_ends_at),
            reveal_ends_at: Some(reveal_ends_at),
            selection_reason: Some(reason),
            satellites: sats,
        })?;

        self.store.update_candidate(
            candidate.id,
            &CandidateUpdate::shown(candidate.times_shown + 1, now),
        )?;

        self.store.append_decision(&DecisionLogEntry {
            candidate_id: candidate.id,
            reason,
            momentum,
            duration_seconds: duration.num_seconds(),
            selected_at: now,
        })?;

        self.broadcaster.broadcast(Event::Rotation {
            new_candidate: CandidateRef {
                id: candidate.id,
                title: candidate.title.clone(),
                url: candidate.url.clone(),
            },
            reason,
            started_at: now,
            rotation_ends_at,
        });

        if candidate.summary.is_none() {
            self.request_summary(&candidate, now);
        }

        metrics::record_rotation(reason.as_str());
        self.rotation_count += 1;
        tracing::info!(
            candidate_id = candidate.id,
            title = %candidate.title,
            reason = %reason,
            trigger = ?trigger,
            rotation = self.rotation_count,
            "Rotated"
        );

        let propagated = self.maybe_propagate(weights);

        Ok(TickAction::Rotated(RotationSummary {
            candidate_id: candidate.id,
            reason,
            trigger,
            satellites: satellite_total,
            rotation_ends_at,
            propagated,
        }))
    }

    /// Queue a summary for a candidate that went on stage without one.
    /// Failures are logged; the rotation itself already happened.
    fn request_summary(&self, candidate: &Candidate, now: DateTime<Utc>) {
        let task = NewTask::new(candidate.id, TaskType::Summarize, PriorityClass::RecentlyIngested)
            .at(now);
        match self.store.enqueue(&task) {
            Ok(Some(task_id)) => {
                tracing::debug!(candidate_id = candidate.id, task_id, "Summary requested")
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                candidate_id = candidate.id,
                error = %e,
                "Failed to request summary"
            ),
        }
    }

    fn maybe_propagate(&self, weights: &ScoreWeights) -> bool {
        let every = self.config.propagate_every;
        if every == 0 || self.rotation_count % every != 0 {
            return false;
        }
        match propagation::propagate_scores(&*self.store, weights) {
            Ok(_) => {
                metrics::record_propagation();
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Score propagation failed");
                false
            }
        }
    }

    /// End the current rotation so the next tick rotates
    pub fn skip_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let state = self.store.load_rotation()?;
        if state.current_candidate_id.is_none() {
            return Ok(false);
        }
        self.store.set_rotation_ends_at(now)?;
        tracing::info!(candidate_id = ?state.current_candidate_id, "Rotation skipped");
        Ok(true)
    }

    /// Run score propagation immediately
    pub fn propagate_now(&self) -> Result<PropagationReport> {
        let weights = ScoreWeights::load(&*self.store)?;
        let report = propagation::propagate_scores(&*self.store, &weights)?;
        metrics::record_propagation();
        Ok(report)
    }

    /// Tick until `shutdown` turns true. An in-flight tick always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.tick_interval_secs,
            "Director loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = self.tick().next_delay;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(rotations = self.rotation_count, "Director loop stopped");
    }
}

/// Time left in the current rotation, negative once overdue
pub fn remaining(state: &RotationState, now: DateTime<Utc>) -> Option<Duration> {
    state.rotation_ends_at.map(|end| end - now)
}
