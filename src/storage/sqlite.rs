//! SQLite implementation of the store traits

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::repository::{
    truncate_error, CandidateOrder, CandidateQuery, CandidateRepository, EnrichmentRepository,
    FeedbackRepository, QueueCounts, RateLimitRepository, RotationRepository, ScoreFilter,
    SettingsRepository, SourceRepository, TaskQueue,
};
use crate::error::{Error, Result};
use crate::models::{
    format_ts, parse_ts, AiUsage, Candidate, CandidateId, CandidateUpdate, DecisionLogEntry,
    Discussion, NewCandidate, NewTask, Nomination, PriorityClass, RateLimitRecord, RotationState,
    Satellite, SelectionReason, Source, SourceId, Tag, Task, TaskId, TaskStatus, Vote,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        trust_score REAL NOT NULL DEFAULT 1.0,
        avg_link_score REAL NOT NULL DEFAULT 0.0
    );

    CREATE TABLE IF NOT EXISTS candidates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        summary TEXT,
        direct_score REAL NOT NULL DEFAULT 0.0,
        times_shown INTEGER NOT NULL DEFAULT 0,
        last_shown_at TEXT,
        feed_id INTEGER REFERENCES sources(id),
        content_vector TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_candidates_feed ON candidates(feed_id);
    CREATE INDEX IF NOT EXISTS idx_candidates_score ON candidates(direct_score);

    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        score REAL NOT NULL DEFAULT 0.0
    );

    CREATE TABLE IF NOT EXISTS tag_sources (
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        source_id INTEGER NOT NULL REFERENCES sources(id),
        PRIMARY KEY (tag_id, source_id)
    );

    CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        candidate_id INTEGER NOT NULL,
        value INTEGER NOT NULL CHECK (value IN (-1, 1)),
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_votes_candidate ON votes(candidate_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_votes_created ON votes(created_at);

    CREATE TABLE IF NOT EXISTS nominations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rotation_id TEXT NOT NULL,
        candidate_id INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_nominations_rotation ON nominations(rotation_id);

    CREATE TABLE IF NOT EXISTS rotation_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current_candidate_id INTEGER,
        started_at TEXT,
        rotation_ends_at TEXT,
        reveal_ends_at TEXT,
        selection_reason TEXT,
        satellites TEXT NOT NULL DEFAULT '[]'
    );

    INSERT OR IGNORE INTO rotation_state (id) VALUES (1);

    CREATE TABLE IF NOT EXISTS decision_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        candidate_id INTEGER NOT NULL,
        reason TEXT NOT NULL,
        momentum TEXT NOT NULL,
        duration_seconds INTEGER NOT NULL,
        selected_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_decision_log_selected ON decision_log(selected_at);

    CREATE TABLE IF NOT EXISTS score_weights (
        key TEXT PRIMARY KEY,
        value REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        candidate_id INTEGER NOT NULL,
        task_type TEXT NOT NULL,
        priority_class TEXT NOT NULL,
        priority_rank INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_pending
        ON tasks(status, priority_rank, created_at);

    CREATE TABLE IF NOT EXISTS api_rate_limits (
        api_name TEXT PRIMARY KEY,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        backoff_until TEXT,
        last_success_at TEXT,
        last_failure_at TEXT,
        last_error TEXT
    );

    CREATE TABLE IF NOT EXISTS external_discussions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        candidate_id INTEGER NOT NULL,
        platform TEXT NOT NULL,
        url TEXT NOT NULL,
        title TEXT NOT NULL,
        score INTEGER NOT NULL DEFAULT 0,
        num_comments INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_discussions_candidate
        ON external_discussions(candidate_id, platform);

    CREATE TABLE IF NOT EXISTS ai_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        candidate_id INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_ai_usage_created ON ai_usage(created_at);
"#;

/// SQLite-backed store
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::lock_poisoned("sqlite connection"))
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| conversion_error(idx, format!("invalid timestamp '{raw}'")))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid timestamp '{raw}'"))),
    }
}

fn parsed_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

const CANDIDATE_COLUMNS: &str = "id, title, url, summary, direct_score, times_shown, \
     last_shown_at, feed_id, content_vector, created_at";

fn row_to_candidate(row: &Row<'_>) -> rusqlite::Result<Candidate> {
    let vector: Option<String> = row.get(8)?;
    let content_vector = match vector {
        Some(raw) => Some(
            serde_json::from_str::<Vec<f32>>(&raw)
                .map_err(|e| conversion_error(8, e.to_string()))?,
        ),
        None => None,
    };

    Ok(Candidate {
        id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        summary: row.get(3)?,
        direct_score: row.get(4)?,
        times_shown: row.get(5)?,
        last_shown_at: opt_ts_at(row, 6)?,
        feed_id: row.get(7)?,
        content_vector,
        created_at: ts_at(row, 9)?,
    })
}

const TASK_COLUMNS: &str = "id, candidate_id, task_type, priority_class, status, attempts, \
     last_error, created_at, updated_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        candidate_id: row.get(1)?,
        task_type: parsed_at(row, 2)?,
        priority_class: parsed_at(row, 3)?,
        status: parsed_at(row, 4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: ts_at(row, 7)?,
        updated_at: ts_at(row, 8)?,
    })
}

fn row_to_rate_limit(row: &Row<'_>) -> rusqlite::Result<RateLimitRecord> {
    Ok(RateLimitRecord {
        api_name: row.get(0)?,
        consecutive_failures: row.get(1)?,
        backoff_until: opt_ts_at(row, 2)?,
        last_success_at: opt_ts_at(row, 3)?,
        last_failure_at: opt_ts_at(row, 4)?,
        last_error: row.get(5)?,
    })
}

fn row_to_decision(row: &Row<'_>) -> rusqlite::Result<DecisionLogEntry> {
    Ok(DecisionLogEntry {
        candidate_id: row.get(0)?,
        reason: parsed_at(row, 1)?,
        momentum: json_at(row, 2)?,
        duration_seconds: row.get(3)?,
        selected_at: ts_at(row, 4)?,
    })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        trust_score: row.get(3)?,
        avg_link_score: row.get(4)?,
    })
}

// ============================================================================
// Trait implementations
// ============================================================================

impl CandidateRepository for SqliteStore {
    fn insert_candidate(&self, candidate: &NewCandidate) -> Result<CandidateId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO candidates (title, url, summary, direct_score, feed_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                candidate.title,
                candidate.url,
                candidate.summary,
                candidate.direct_score,
                candidate.feed_id,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        let conn = self.conn()?;
        let candidate = conn
            .query_row(
                &format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?1"),
                params![id],
                row_to_candidate,
            )
            .optional()?;
        Ok(candidate)
    }

    fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let mut clauses: Vec<String> = Vec::new();
        match query.score {
            ScoreFilter::Any => {}
            ScoreFilter::Zero => clauses.push("direct_score = 0".to_string()),
            ScoreFilter::Positive => clauses.push("direct_score > 0".to_string()),
        }
        if !query.exclude.is_empty() {
            let placeholders = vec!["?"; query.exclude.len()].join(",");
            clauses.push(format!("id NOT IN ({placeholders})"));
        }

        let mut sql = format!("SELECT {CANDIDATE_COLUMNS} FROM candidates");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match query.order {
            CandidateOrder::Id => " ORDER BY id ASC",
            CandidateOrder::TimesShownAsc => " ORDER BY times_shown ASC, id ASC",
            CandidateOrder::ScoreDesc => " ORDER BY direct_score DESC, id ASC",
        });
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(query.exclude.iter()), row_to_candidate)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn update_candidate(&self, id: CandidateId, update: &CandidateUpdate) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE candidates SET
                direct_score = COALESCE(?2, direct_score),
                times_shown = COALESCE(?3, times_shown),
                last_shown_at = COALESCE(?4, last_shown_at),
                summary = COALESCE(?5, summary)
             WHERE id = ?1",
            params![
                id,
                update.direct_score,
                update.times_shown,
                update.last_shown_at.map(format_ts),
                update.summary,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("candidate", id));
        }
        Ok(())
    }

    fn count_candidates(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM candidates", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl SourceRepository for SqliteStore {
    fn insert_source(&self, name: &str, kind: &str) -> Result<SourceId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sources (name, kind) VALUES (?1, ?2)",
            params![name, kind],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        let conn = self.conn()?;
        let source = conn
            .query_row(
                "SELECT id, name, kind, trust_score, avg_link_score FROM sources WHERE id = ?1",
                params![id],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, trust_score, avg_link_score FROM sources ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_source)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn update_source_scores(
        &self,
        id: SourceId,
        trust_score: f64,
        avg_link_score: f64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sources SET trust_score = ?2, avg_link_score = ?3 WHERE id = ?1",
            params![id, trust_score, avg_link_score],
        )?;
        if changed == 0 {
            return Err(Error::not_found("source", id));
        }
        Ok(())
    }

    fn insert_tag(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO tags (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    fn link_tag_source(&self, tag_id: i64, source_id: SourceId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO tag_sources (tag_id, source_id) VALUES (?1, ?2)",
            params![tag_id, source_id],
        )?;
        Ok(())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, score FROM tags ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    score: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn tag_source_ids(&self, tag_id: i64) -> Result<Vec<SourceId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT source_id FROM tag_sources WHERE tag_id = ?1 ORDER BY source_id")?;
        let rows = stmt
            .query_map(params![tag_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<SourceId>>>()?;
        Ok(rows)
    }

    fn update_tag_score(&self, tag_id: i64, score: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tags SET score = ?2 WHERE id = ?1",
            params![tag_id, score],
        )?;
        Ok(())
    }
}

impl FeedbackRepository for SqliteStore {
    fn record_vote(&self, vote: &Vote) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO votes (user_id, candidate_id, value, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                vote.user_id,
                vote.candidate_id,
                vote.value,
                format_ts(vote.created_at)
            ],
        )?;
        Ok(())
    }

    fn votes_since(&self, candidate_id: CandidateId, since: DateTime<Utc>) -> Result<Vec<Vote>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, candidate_id, value, created_at FROM votes
             WHERE candidate_id = ?1 AND created_at >= ?2
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![candidate_id, format_ts(since)], |row| {
                Ok(Vote {
                    user_id: row.get(0)?,
                    candidate_id: row.get(1)?,
                    value: row.get(2)?,
                    created_at: ts_at(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn vote_kinds_since(&self, since: DateTime<Utc>) -> Result<Vec<(Option<String>, i8)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.kind, v.value FROM votes v
             LEFT JOIN candidates c ON c.id = v.candidate_id
             LEFT JOIN sources s ON s.id = c.feed_id
             WHERE v.created_at >= ?1
             ORDER BY v.id",
        )?;
        let rows = stmt
            .query_map(params![format_ts(since)], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn vote_totals(&self) -> Result<BTreeMap<CandidateId, i64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT candidate_id, SUM(value) FROM votes GROUP BY candidate_id")?;
        let totals = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<CandidateId, i64>>>()?;
        Ok(totals)
    }

    fn add_nomination(&self, nomination: &Nomination) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO nominations (rotation_id, candidate_id) VALUES (?1, ?2)",
            params![nomination.rotation_id, nomination.candidate_id],
        )?;
        Ok(())
    }

    fn nominations_for(&self, rotation_id: &str) -> Result<Vec<Nomination>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rotation_id, candidate_id FROM nominations WHERE rotation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![rotation_id], |row| {
                Ok(Nomination {
                    rotation_id: row.get(0)?,
                    candidate_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn clear_nominations(&self, rotation_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM nominations WHERE rotation_id = ?1",
            params![rotation_id],
        )?;
        Ok(removed)
    }
}

impl RotationRepository for SqliteStore {
    fn load_rotation(&self) -> Result<RotationState> {
        let conn = self.conn()?;
        let state = conn.query_row(
            "SELECT current_candidate_id, started_at, rotation_ends_at, reveal_ends_at,
                    selection_reason, satellites
             FROM rotation_state WHERE id = 1",
            [],
            |row| {
                let reason: Option<String> = row.get(4)?;
                let selection_reason = match reason {
                    Some(raw) => Some(
                        raw.parse::<SelectionReason>()
                            .map_err(|e| conversion_error(4, e))?,
                    ),
                    None => None,
                };
                Ok(RotationState {
                    current_candidate_id: row.get(0)?,
                    started_at: opt_ts_at(row, 1)?,
                    rotation_ends_at: opt_ts_at(row, 2)?,
                    reveal_ends_at: opt_ts_at(row, 3)?,
                    selection_reason,
                    satellites: json_at::<Vec<Satellite>>(row, 5)?,
                })
            },
        )?;
        Ok(state)
    }

    fn save_rotation(&self, state: &RotationState) -> Result<()> {
        let satellites = serde_json::to_string(&state.satellites)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE rotation_state SET
                current_candidate_id = ?1,
                started_at = ?2,
                rotation_ends_at = ?3,
                reveal_ends_at = ?4,
                selection_reason = ?5,
                satellites = ?6
             WHERE id = 1",
            params![
                state.current_candidate_id,
                state.started_at.map(format_ts),
                state.rotation_ends_at.map(format_ts),
                state.reveal_ends_at.map(format_ts),
                state.selection_reason.map(|r| r.as_str()),
                satellites,
            ],
        )?;
        Ok(())
    }

    fn set_rotation_ends_at(&self, ends_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE rotation_state SET rotation_ends_at = ?1 WHERE id = 1",
            params![format_ts(ends_at)],
        )?;
        Ok(())
    }

    fn rotation_row_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM rotation_state", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn append_decision(&self, entry: &DecisionLogEntry) -> Result<()> {
        let momentum = serde_json::to_string(&entry.momentum)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO decision_log (candidate_id, reason, momentum, duration_seconds, selected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.candidate_id,
                entry.reason.as_str(),
                momentum,
                entry.duration_seconds,
                format_ts(entry.selected_at),
            ],
        )?;
        Ok(())
    }

    fn recent_shown_ids(&self, n: usize) -> Result<Vec<CandidateId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT candidate_id FROM decision_log
             GROUP BY candidate_id
             ORDER BY MAX(selected_at) DESC, MAX(id) DESC
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![n as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<CandidateId>>>()?;
        Ok(ids)
    }

    fn recent_decisions(&self, n: usize) -> Result<Vec<DecisionLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT candidate_id, reason, momentum, duration_seconds, selected_at
             FROM decision_log ORDER BY selected_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![n as i64], row_to_decision)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl TaskQueue for SqliteStore {
    fn enqueue(&self, task: &NewTask) -> Result<Option<TaskId>> {
        let conn = self.conn()?;
        let created_at = format_ts(task.created_at);
        let inserted = conn.execute(
            "INSERT INTO tasks (candidate_id, task_type, priority_class, priority_rank,
                                status, attempts, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM tasks
                 WHERE candidate_id = ?1 AND task_type = ?2
                   AND status IN ('pending', 'in_progress')
             )",
            params![
                task.candidate_id,
                task.task_type.as_str(),
                task.priority_class.as_str(),
                task.priority_class.rank(),
                created_at,
            ],
        )?;
        Ok((inserted > 0).then(|| conn.last_insert_rowid()))
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    fn next_pending(&self, class: PriorityClass) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending' AND priority_class = ?1
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![class.as_str()],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    fn claim(&self, id: TaskId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    fn mark_done(&self, id: TaskId) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'done', last_error = NULL, updated_at = ?2 WHERE id = ?1",
            params![id, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::not_found("task", id));
        }
        Ok(())
    }

    fn mark_failed(&self, id: TaskId, error: &str, max_attempts: u32) -> Result<TaskStatus> {
        let conn = self.conn()?;
        let attempts: u32 = conn
            .query_row(
                "SELECT attempts FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("task", id))?;

        let status = if attempts >= max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };

        conn.execute(
            "UPDATE tasks SET status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                status.as_str(),
                truncate_error(error),
                format_ts(Utc::now())
            ],
        )?;
        Ok(status)
    }

    fn release(&self, id: TaskId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'pending', attempts = MAX(attempts - 1, 0), updated_at = ?2
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    fn reset_in_progress(&self) -> Result<usize> {
        let conn = self.conn()?;
        let reset = conn.execute(
            "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE status = 'in_progress'",
            params![format_ts(Utc::now())],
        )?;
        Ok(reset)
    }

    fn queue_counts(&self) -> Result<QueueCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let by_status = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, i64>>>()?;
        Ok(QueueCounts { by_status })
    }
}

impl RateLimitRepository for SqliteStore {
    fn get_rate_limit(&self, api_name: &str) -> Result<Option<RateLimitRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT api_name, consecutive_failures, backoff_until, last_success_at,
                        last_failure_at, last_error
                 FROM api_rate_limits WHERE api_name = ?1",
                params![api_name],
                row_to_rate_limit,
            )
            .optional()?;
        Ok(record)
    }

    fn put_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_rate_limits (api_name, consecutive_failures, backoff_until,
                                          last_success_at, last_failure_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(api_name) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                backoff_until = excluded.backoff_until,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                last_error = excluded.last_error",
            params![
                record.api_name,
                record.consecutive_failures,
                record.backoff_until.map(format_ts),
                record.last_success_at.map(format_ts),
                record.last_failure_at.map(format_ts),
                record.last_error,
            ],
        )?;
        Ok(())
    }

    fn list_rate_limits(&self) -> Result<Vec<RateLimitRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT api_name, consecutive_failures, backoff_until, last_success_at,
                    last_failure_at, last_error
             FROM api_rate_limits ORDER BY api_name",
        )?;
        let rows = stmt
            .query_map([], row_to_rate_limit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl SettingsRepository for SqliteStore {
    fn score_weights(&self) -> Result<Vec<(String, f64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM score_weights ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn set_score_weight(&self, key: &str, value: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO score_weights (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl EnrichmentRepository for SqliteStore {
    fn save_discussions(
        &self,
        candidate_id: CandidateId,
        platform: &str,
        discussions: &[Discussion],
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM external_discussions WHERE candidate_id = ?1 AND platform = ?2",
            params![candidate_id, platform],
        )?;
        for d in discussions {
            tx.execute(
                "INSERT INTO external_discussions
                    (candidate_id, platform, url, title, score, num_comments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![candidate_id, platform, d.url, d.title, d.score, d.num_comments],
            )?;
        }
        tx.commit()?;
        Ok(discussions.len())
    }

    fn discussions_for(&self, candidate_id: CandidateId) -> Result<Vec<Discussion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT platform, url, title, score, num_comments FROM external_discussions
             WHERE candidate_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![candidate_id], |row| {
                Ok(Discussion {
                    platform: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    score: row.get(3)?,
                    num_comments: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn record_ai_usage(&self, usage: &AiUsage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ai_usage (model, input_tokens, output_tokens, cost_usd, candidate_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                usage.model,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cost_usd,
                usage.candidate_id,
                format_ts(usage.created_at),
            ],
        )?;
        Ok(())
    }

    fn ai_spend_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn()?;
        let spend: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM ai_usage WHERE created_at >= ?1",
            params![format_ts(since)],
            |row| row.get(0),
        )?;
        Ok(spend)
    }
}
