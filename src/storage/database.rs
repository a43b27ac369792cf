//! SQLite persistence for tasks, findings, events and workflows.
//!
//! Uses rusqlite with WAL mode. The connection sits behind one mutex, which
//! also serializes sequence assignment for the event log. Async callers go
//! through [`crate::util::blocking`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::{Category, Finding, FindingMirror, Task, TaskId, TaskType};
use crate::storage::StateStore;
use crate::stream::{EventLog, EventType, StatusSource, StreamEvent};
use crate::util::blocking;
use crate::workflow::{WorkflowId, WorkflowStatus};
use crate::{rlog, Error, Result};

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file, creating its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;
        rlog!("SQLite database opened at: {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Run `f` with the locked connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Persistence(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// [`Database::with_conn`] on the blocking pool.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        blocking(move || db.with_conn(f)).await
    }

    fn initialize_tables(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    target          TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    created_at      TEXT NOT NULL,
                    updated_at      TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    task_type       TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    priority        INTEGER NOT NULL,
                    depends_on      TEXT NOT NULL DEFAULT '[]',
                    created_at      TEXT NOT NULL,
                    started_at      TEXT,
                    completed_at    TEXT,
                    result          TEXT,
                    error           TEXT,
                    record          TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id);

                CREATE TABLE IF NOT EXISTS findings (
                    category        TEXT NOT NULL,
                    key             TEXT NOT NULL,
                    value           TEXT NOT NULL,
                    produced_by     TEXT NOT NULL,
                    discovered_at   TEXT NOT NULL,
                    PRIMARY KEY (category, key)
                );

                CREATE TABLE IF NOT EXISTS events (
                    workflow_id     TEXT NOT NULL,
                    sequence        INTEGER NOT NULL,
                    event_type      TEXT NOT NULL,
                    payload         TEXT NOT NULL,
                    timestamp       TEXT NOT NULL,
                    UNIQUE (workflow_id, sequence)
                );
                ",
            )?;
            Ok(())
        })
    }

    // ---- workflows ----

    pub fn upsert_workflow(
        &self,
        workflow_id: WorkflowId,
        target: &str,
        status: WorkflowStatus,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflows (id, target, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                                               updated_at = excluded.updated_at",
                params![workflow_id.to_string(), target, status.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn workflow_status(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowStatus>> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM workflows WHERE id = ?1",
                    params![workflow_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|s| s.parse()).transpose()
    }

    // ---- tasks ----

    pub fn upsert_task(&self, workflow_id: WorkflowId, task: &Task) -> Result<()> {
        let depends_on = serde_json::to_string(&task.depends_on)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let record = serde_json::to_string(task)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, workflow_id, task_type, status, priority, depends_on,
                                    created_at, started_at, completed_at, result, error, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    priority = excluded.priority,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    result = excluded.result,
                    error = excluded.error,
                    record = excluded.record",
                params![
                    task.id.to_string(),
                    workflow_id.to_string(),
                    task.task_type.as_str(),
                    task.status.label(),
                    task.priority,
                    depends_on,
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    result,
                    task.error(),
                    record,
                ],
            )?;
            Ok(())
        })
    }

    /// Tasks of a workflow in submission order.
    pub fn load_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        let records: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM tasks WHERE workflow_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![workflow_id.to_string()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })?;
        let mut tasks = records
            .iter()
            .map(|r| serde_json::from_str::<Task>(r).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    pub fn task_status_label(&self, task_id: TaskId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1",
                    params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    // ---- findings ----

    pub fn upsert_finding(&self, finding: &Finding) -> Result<()> {
        let value = serde_json::to_string(&finding.value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO findings (category, key, value, produced_by, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(category, key) DO UPDATE SET
                    value = excluded.value,
                    produced_by = excluded.produced_by,
                    discovered_at = excluded.discovered_at",
                params![
                    finding.category.as_str(),
                    finding.key,
                    value,
                    finding.produced_by.to_string(),
                    finding.discovered_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Persisted findings of a category, ordered by key.
    pub fn load_findings(&self, category: Category) -> Result<Vec<Finding>> {
        let rows: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, produced_by, discovered_at FROM findings
                 WHERE category = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![category.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(key, value, produced_by, discovered_at)| -> Result<Finding> {
                Ok(Finding {
                    category,
                    key,
                    value: serde_json::from_str(&value)?,
                    produced_by: produced_by
                        .parse()
                        .map_err(|e| Error::Persistence(format!("bad task id: {}", e)))?,
                    discovered_at: parse_timestamp(&discovered_at)?,
                })
            })
            .collect()
    }

    // ---- events ----

    fn append_event(
        &self,
        workflow_id: WorkflowId,
        event_type: EventType,
        payload: Value,
    ) -> Result<StreamEvent> {
        let encoded = serde_json::to_string(&payload)?;
        let timestamp = Utc::now();
        let sequence = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE workflow_id = ?1",
                params![workflow_id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO events (workflow_id, sequence, event_type, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    workflow_id.to_string(),
                    next,
                    event_type.as_str(),
                    encoded,
                    timestamp.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(next)
        })?;
        Ok(StreamEvent {
            workflow_id,
            sequence: sequence as u64,
            event_type,
            payload,
            timestamp,
        })
    }

    fn events_after(&self, workflow_id: WorkflowId, after: u64) -> Result<Vec<StreamEvent>> {
        let after = i64::try_from(after).unwrap_or(i64::MAX);
        let rows: Vec<(i64, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, event_type, payload, timestamp FROM events
                 WHERE workflow_id = ?1 AND sequence > ?2 ORDER BY sequence",
            )?;
            let rows = stmt
                .query_map(params![workflow_id.to_string(), after], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(sequence, event_type, payload, timestamp)| -> Result<StreamEvent> {
                Ok(StreamEvent {
                    workflow_id,
                    sequence: sequence as u64,
                    event_type: event_type.parse()?,
                    payload: serde_json::from_str(&payload)?,
                    timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("bad timestamp {}: {}", raw, e)))
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl FindingMirror for Database {
    fn upsert_finding(&self, finding: &Finding) -> Result<()> {
        Database::upsert_finding(self, finding)
    }
}

#[async_trait]
impl StateStore for Database {
    async fn record_workflow(
        &self,
        workflow_id: WorkflowId,
        target: &str,
        status: WorkflowStatus,
    ) -> Result<()> {
        let db = self.clone();
        let target = target.to_string();
        blocking(move || db.upsert_workflow(workflow_id, &target, status)).await
    }

    async fn record_task(&self, workflow_id: WorkflowId, task: &Task) -> Result<()> {
        let db = self.clone();
        let task = task.clone();
        blocking(move || db.upsert_task(workflow_id, &task)).await
    }
}

#[async_trait]
impl StatusSource for Database {
    async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowStatus>> {
        let db = self.clone();
        blocking(move || Database::workflow_status(&db, workflow_id)).await
    }
}

#[async_trait]
impl EventLog for Database {
    async fn append(
        &self,
        workflow_id: WorkflowId,
        event_type: EventType,
        payload: Value,
    ) -> Result<StreamEvent> {
        let db = self.clone();
        blocking(move || db.append_event(workflow_id, event_type, payload)).await
    }

    async fn read_after(&self, workflow_id: WorkflowId, after: u64) -> Result<Vec<StreamEvent>> {
        let db = self.clone();
        blocking(move || db.events_after(workflow_id, after)).await
    }
}
