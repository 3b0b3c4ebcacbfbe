//! linksite - Rotation director and enrichment worker for a community link board
//!
//! One link is "on stage" at a time. The director decides which one, for how
//! long, and which related links orbit it; the worker enriches links in the
//! background without overrunning third-party API quotas.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and tunable score weights
//! - [`director`] - Rotation engine: timers, selection, satellites, propagation
//! - [`worker`] - Priority queue consumer and external API executors
//! - [`ratelimit`] - Persisted failure backoff and per-minute quotas
//! - [`storage`] - Repository traits with SQLite and in-memory backends
//! - [`broadcast`] - Fire-and-forget rotation and task events
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus counters and gauges
//!
//! # Example
//!
//! ```no_run
//! use linksite::broadcast::NoopBroadcaster;
//! use linksite::config::Config;
//! use linksite::director::Director;
//! use linksite::storage::create_sqlite_store;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = create_sqlite_store(&config.database.sqlite_path)?;
//!     let mut director = Director::new(store, Arc::new(NoopBroadcaster), config.director);
//!     let outcome = director.tick();
//!     println!("{:?}", outcome.result);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod director;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod storage;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broadcast::{ChannelBroadcaster, Event, EventBroadcaster, NoopBroadcaster};
    pub use crate::config::{Config, ScoreWeights, WeightKey};
    pub use crate::director::{Director, TickAction, TickOutcome};
    pub use crate::error::{EnrichError, Error, ErrorCategory, LinksiteErrorTrait, Result};
    pub use crate::models::{
        Candidate, PriorityClass, RotationState, SelectionReason, TaskStatus, TaskType,
    };
    pub use crate::ratelimit::{ApiGate, BackoffStore, GateDecision, RequestLimiter};
    pub use crate::storage::{create_memory_store, create_sqlite_store, SharedStore, Store};
    pub use crate::worker::{PriorityWorker, TaskExecutor, WorkerAction};
}

// Direct re-exports for convenience
pub use models::{PriorityClass, SelectionReason, TaskStatus, TaskType};
