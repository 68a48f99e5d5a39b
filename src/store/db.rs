use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the iteration database.
///
/// Wraps `IterationDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<IterationDb>>,
}

impl DbHandle {
    pub fn new(db: IterationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&IterationDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct IterationDb {
    conn: Connection,
}

impl IterationDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to set journal mode")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS code_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    version_id TEXT,
                    files TEXT NOT NULL DEFAULT '{}',
                    accepted INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS durable_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    metadata TEXT,
                    version_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, id);
                CREATE INDEX IF NOT EXISTS idx_snapshots_project ON code_snapshots(project_id, accepted, id);
                CREATE INDEX IF NOT EXISTS idx_durable_events_key ON durable_events(project_id, event_type, message);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn append_message(&self, project_id: &str, message: &ChatMessage) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO messages (project_id, role, content) VALUES (?1, ?2, ?3)",
                params![project_id, message.role.as_str(), message.content],
            )
            .context("Failed to insert message")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The `limit` most recent messages, oldest first.
    pub fn recent_messages(&self, project_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT role, content FROM messages WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_messages")?;
        let rows = stmt
            .query_map(params![project_id, limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row.context("Failed to read message row")?;
            let role = Role::from_str(&role)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse message role")?;
            messages.push(ChatMessage { role, content });
        }
        messages.reverse();
        Ok(messages)
    }

    // ── Code snapshots ────────────────────────────────────────────────

    pub fn save_snapshot(
        &self,
        project_id: &str,
        version_id: Option<&str>,
        files: &FileMap,
        accepted: bool,
    ) -> Result<i64> {
        let files_json = serde_json::to_string(files).context("Failed to serialize snapshot")?;
        self.conn
            .execute(
                "INSERT INTO code_snapshots (project_id, version_id, files, accepted) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, version_id, files_json, accepted as i64],
            )
            .context("Failed to insert code snapshot")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn accept_snapshot(&self, project_id: &str, snapshot_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE code_snapshots SET accepted = 1 WHERE id = ?1 AND project_id = ?2",
                params![snapshot_id, project_id],
            )
            .context("Failed to accept code snapshot")?;
        Ok(changed > 0)
    }

    /// Files of the most recent accepted snapshot; empty when none exists.
    pub fn latest_accepted_snapshot(&self, project_id: &str) -> Result<FileMap> {
        let files: Option<String> = self
            .conn
            .query_row(
                "SELECT files FROM code_snapshots WHERE project_id = ?1 AND accepted = 1 ORDER BY id DESC LIMIT 1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query latest snapshot")?;
        match files {
            Some(json) => serde_json::from_str(&json).context("Failed to parse snapshot files JSON"),
            None => Ok(FileMap::new()),
        }
    }

    // ── Durable events ────────────────────────────────────────────────

    /// Insert a durable event. With `dedupe` set, an existing row with the same
    /// (project, type, message, version) wins and the insert is skipped. Rows
    /// without a version only collide with other unversioned rows.
    pub fn insert_durable_event(&self, event: &NewDurableEvent) -> Result<InsertOutcome> {
        if event.dedupe {
            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM durable_events WHERE project_id = ?1 AND event_type = ?2 AND message = ?3 AND version_id IS ?4 LIMIT 1",
                    params![event.project_id, event.event_type, event.message, event.version_id],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to check for duplicate durable event")?;
            if existing.is_some() {
                return Ok(InsertOutcome::Duplicate);
            }
        }

        let metadata = match &event.metadata {
            Some(m) => Some(serde_json::to_string(m).context("Failed to serialize event metadata")?),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO durable_events (project_id, event_type, message, metadata, version_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.project_id,
                    event.event_type,
                    event.message,
                    metadata,
                    event.version_id
                ],
            )
            .context("Failed to insert durable event")?;
        Ok(InsertOutcome::Inserted)
    }

    pub fn list_durable_events(
        &self,
        project_id: &str,
        version_id: Option<&str>,
    ) -> Result<Vec<DurableEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, event_type, message, metadata, version_id, created_at \
                 FROM durable_events WHERE project_id = ?1 AND (?2 IS NULL OR version_id = ?2) ORDER BY id",
            )
            .context("Failed to prepare list_durable_events")?;
        let rows = stmt
            .query_map(params![project_id, version_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query durable events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, project_id, event_type, message, metadata_str, version_id, created_at) = row?;
            let metadata = match metadata_str {
                Some(s) => Some(
                    serde_json::from_str(&s)
                        .map_err(|e| anyhow::anyhow!("corrupt event metadata JSON '{}': {}", s, e))?,
                ),
                None => None,
            };
            events.push(DurableEvent {
                id,
                project_id,
                event_type,
                message,
                metadata,
                version_id,
                created_at,
            });
        }
        Ok(events)
    }

    pub fn count_durable_events(&self, project_id: &str, event_type: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM durable_events WHERE project_id = ?1 AND event_type = ?2",
                params![project_id, event_type],
                |row| row.get(0),
            )
            .context("Failed to count durable events")
    }
}
