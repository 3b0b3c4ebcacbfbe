//! Integration tests module
//!
//! End-to-end tests for the linksite engine, including:
//! - Rotation lifecycle: selection, timers, vetoes, nominations
//! - Score propagation
//! - Worker priority ordering, deferral and retry
//! - Enrichment executors over HTTP

pub mod director_test;
pub mod enrich_http_test;
pub mod fixtures;
pub mod propagation_test;
pub mod worker_test;
