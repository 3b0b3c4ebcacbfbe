//! Common test utilities

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use linksite::storage::{create_memory_store, create_sqlite_store, SharedStore};

/// Fixed reference instant
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap()
}

/// A store under test; the directory keeps a SQLite file alive
pub struct Backend {
    pub name: &'static str,
    pub store: SharedStore,
    _dir: Option<TempDir>,
}

/// One fresh store per backend
pub fn backends() -> Vec<Backend> {
    let dir = TempDir::new().unwrap();
    let sqlite = create_sqlite_store(dir.path().join("test.db")).unwrap();
    vec![
        Backend {
            name: "memory",
            store: create_memory_store(),
            _dir: None,
        },
        Backend {
            name: "sqlite",
            store: sqlite,
            _dir: Some(dir),
        },
    ]
}
