//! Persistence for rotation, feedback, tasks and backoff state
//!
//! The core only depends on the traits in [`repository`]; `SqliteStore` is
//! the production backend and `MemoryStore` the test double.

pub mod memory;
pub mod repository;
pub mod sqlite;

pub use memory::MemoryStore;
pub use repository::{
    create_memory_store, create_sqlite_store, truncate_error, CandidateOrder, CandidateQuery,
    CandidateRepository, EnrichmentRepository, FeedbackRepository, QueueCounts,
    RateLimitRepository, RotationRepository, ScoreFilter, SettingsRepository, SharedStore,
    SourceRepository, Store, TaskQueue, MAX_ERROR_LEN,
};
pub use sqlite::SqliteStore;
