//! SQLite-backed durable submission log.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::store::SubmissionStore;
use crate::{PendingSubmission, QueueError, SubmissionId};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Durable store on a single SQLite file.
///
/// Each operation is one statement, so every add and remove is atomic on its
/// own key.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(|e| {
            QueueError::storage_with_source(
                format!("Failed to open submission database {}", path.display()),
                e,
            )
        })?;
        info!(path = %path.display(), "Opened submission store");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QueueError::storage_with_source("Failed to open in-memory store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        let version: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map_err(storage_err)?;

        let version = if version > 0 {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&Connection) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| QueueError::storage("Submission store connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| QueueError::storage_with_source("Storage task failed", e))?
    }
}

fn create_schema_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS form_submissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| QueueError::storage_with_source("Failed to create schema", e))?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )
    .map_err(storage_err)?;

    debug!(version = SCHEMA_VERSION, "Created submission schema");
    Ok(())
}

fn storage_err(e: rusqlite::Error) -> QueueError {
    QueueError::storage_with_source("SQLite operation failed", e)
}

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn add(&self, payload: JsonValue) -> Result<SubmissionId, QueueError> {
        let text = serde_json::to_string(&payload).map_err(|e| QueueError::Encoding(e.to_string()))?;
        let now = Utc::now().timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO form_submissions (payload, created_at) VALUES (?, ?)",
                params![text, now],
            )
            .map_err(storage_err)?;
            Ok(SubmissionId(conn.last_insert_rowid() as u64))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<PendingSubmission>, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, payload, created_at FROM form_submissions ORDER BY id ASC")
                .map_err(storage_err)?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (id, payload, created_at) = row.map_err(storage_err)?;
                let payload = serde_json::from_str(&payload)
                    .map_err(|e| QueueError::Encoding(format!("submission {id}: {e}")))?;
                out.push(PendingSubmission {
                    id: SubmissionId(id as u64),
                    payload,
                    created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn remove(&self, id: SubmissionId) -> Result<bool, QueueError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM form_submissions WHERE id = ?",
                    params![id.0 as i64],
                )
                .map_err(storage_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn len(&self) -> Result<usize, QueueError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM form_submissions", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
            .map_err(storage_err)
        })
        .await
    }
}
