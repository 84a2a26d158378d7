//! SQLite persistence for tasks, stages, logs, and the job queue table.
//!
//! `TaskStore` owns the connection and is always accessed through `DbHandle`,
//! which serialises access behind a mutex and runs the closure on tokio's
//! blocking pool. Timestamps are stored as fixed-width RFC 3339 TEXT so
//! lexicographic comparison in SQL matches chronological order.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::models::{LogEntry, LogLevel, Repository, Stage, StageName, StageStatus, Task, TaskStatus, TaskType};

/// Format a timestamp the way every table stores it.
pub fn now_string() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    let fixed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: '{}'", s))?;
    Ok(fixed.with_timezone(&Utc))
}

/// Async-safe handle to the task database.
///
/// Wraps `TaskStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskStore>>,
}

impl DbHandle {
    pub fn new(store: TaskStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TaskStore) -> Result<R> + Send + 'static,
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

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests; must not be called on a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TaskStore>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A queued pipeline run, as stored in the `jobs` table.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub task_id: Uuid,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
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
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL DEFAULT 'anonymous',
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    task_type TEXT NOT NULL,
                    repository TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stages (
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    completed_at TEXT,
                    output TEXT,
                    error TEXT,
                    PRIMARY KEY (task_id, name)
                );

                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    timestamp TEXT NOT NULL,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    data TEXT
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 1,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    base_delay_ms INTEGER NOT NULL DEFAULT 5000,
                    state TEXT NOT NULL DEFAULT 'queued',
                    available_at TEXT NOT NULL,
                    claimed_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_stages_task ON stages(task_id, position);
                CREATE INDEX IF NOT EXISTS idx_logs_task ON logs(task_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, available_at, priority);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    /// Insert or fully overwrite a task and its stage rows (last write wins).
    /// Logs are append-only and written separately via `append_log`.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let repository =
            serde_json::to_string(&task.repository).context("Failed to serialize repository")?;

        // unchecked_transaction: DbHandle's mutex already guarantees
        // single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            "INSERT INTO tasks (id, owner, title, description, task_type, repository, status, progress, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                owner = ?2,
                title = ?3,
                description = ?4,
                task_type = ?5,
                repository = ?6,
                status = ?7,
                progress = ?8,
                updated_at = ?10",
            params![
                task.id.to_string(),
                task.owner,
                task.title,
                task.description,
                task.task_type.as_str(),
                repository,
                task.status.as_str(),
                task.progress as i64,
                format_ts(task.created_at),
                now_string(),
            ],
        )
        .context("Failed to upsert task")?;

        for (position, stage) in task.stages.iter().enumerate() {
            let output = match &stage.output {
                Some(v) => {
                    Some(serde_json::to_string(v).context("Failed to serialize stage output")?)
                }
                None => None,
            };
            tx.execute(
                "INSERT INTO stages (task_id, name, position, status, started_at, completed_at, output, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(task_id, name) DO UPDATE SET
                    position = ?3,
                    status = ?4,
                    started_at = ?5,
                    completed_at = ?6,
                    output = ?7,
                    error = ?8",
                params![
                    task.id.to_string(),
                    stage.name.as_str(),
                    position as i64,
                    stage.status.as_str(),
                    stage.started_at.map(format_ts),
                    stage.completed_at.map(format_ts),
                    output,
                    stage.error,
                ],
            )
            .context("Failed to upsert stage")?;
        }

        tx.commit().context("Failed to commit task save")?;
        Ok(())
    }

    pub fn load_task(&self, id: Uuid) -> Result<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner, title, description, task_type, repository, status, progress, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )
            .context("Failed to prepare load_task")?;
        let row = stmt
            .query_row(params![id.to_string()], |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    task_type: row.get(4)?,
                    repository: row.get(5)?,
                    status: row.get(6)?,
                    progress: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })
            .optional()
            .context("Failed to query task")?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let stages = self.load_stages(id)?;
        let logs = self.load_logs(id)?;
        Ok(Some(row.into_task(stages, logs)?))
    }

    /// List all tasks, newest first. Logs are omitted from listings; fetch a
    /// single task for the full record.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner, title, description, task_type, repository, status, progress, created_at, updated_at
                 FROM tasks ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    task_type: row.get(4)?,
                    repository: row.get(5)?,
                    status: row.get(6)?,
                    progress: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })
            .context("Failed to query tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            let id = Uuid::parse_str(&r.id)
                .with_context(|| format!("Invalid task id in database: '{}'", r.id))?;
            let stages = self.load_stages(id)?;
            tasks.push(r.into_task(stages, Vec::new())?);
        }
        Ok(tasks)
    }

    fn load_stages(&self, task_id: Uuid) -> Result<Vec<Stage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, status, started_at, completed_at, output, error
                 FROM stages WHERE task_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare load_stages")?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query stages")?;

        let mut stages = Vec::new();
        for row in rows {
            let (name, status, started_at, completed_at, output, error) =
                row.context("Failed to read stage row")?;
            stages.push(Stage {
                name: StageName::from_str(&name)
                    .map_err(|e| anyhow::anyhow!("invalid stage name in database: {}", e))?,
                status: StageStatus::from_str(&status)
                    .map_err(|e| anyhow::anyhow!("invalid stage status in database: {}", e))?,
                started_at: started_at.as_deref().map(parse_ts).transpose()?,
                completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
                output: output
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("Corrupt stage output JSON")?,
                error,
            });
        }
        Ok(stages)
    }

    fn load_logs(&self, task_id: Uuid) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, level, message, data FROM logs WHERE task_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare load_logs")?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .context("Failed to query logs")?;

        let mut logs = Vec::new();
        for row in rows {
            let (timestamp, level, message, data) = row.context("Failed to read log row")?;
            logs.push(LogEntry {
                timestamp: parse_ts(&timestamp)?,
                level: LogLevel::from_str(&level)
                    .map_err(|e| anyhow::anyhow!("invalid log level in database: {}", e))?,
                message,
                data: data
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("Corrupt log data JSON")?,
            });
        }
        Ok(logs)
    }

    /// Append one log entry. Logs are immutable once written; this is the
    /// only write path for the `logs` table.
    pub fn append_log(&self, task_id: Uuid, entry: &LogEntry) -> Result<()> {
        let data = match &entry.data {
            Some(v) => Some(serde_json::to_string(v).context("Failed to serialize log data")?),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO logs (task_id, timestamp, level, message, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id.to_string(),
                    format_ts(entry.timestamp),
                    entry.level.as_str(),
                    entry.message,
                    data,
                ],
            )
            .context("Failed to insert log entry")?;
        Ok(())
    }

    // ── Job queue ─────────────────────────────────────────────────────

    pub fn insert_job(
        &self,
        task_id: Uuid,
        priority: i64,
        max_attempts: u32,
        base_delay_ms: u64,
        available_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO jobs (task_id, priority, max_attempts, base_delay_ms, available_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task_id.to_string(),
                    priority,
                    max_attempts as i64,
                    base_delay_ms as i64,
                    format_ts(available_at),
                    now_string(),
                ],
            )
            .context("Failed to insert job")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claim the next due job: highest priority first, FIFO within a
    /// priority. Tasks that already have an active job are skipped so at
    /// most one job per task is in flight. The select-then-update pair is
    /// atomic because every caller goes through the `DbHandle` mutex.
    pub fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<JobRow>> {
        let now_s = format_ts(now);
        let row = self
            .conn
            .query_row(
                "SELECT id, task_id, priority, attempt, max_attempts, base_delay_ms
                 FROM jobs
                 WHERE state = 'queued'
                   AND available_at <= ?1
                   AND task_id NOT IN (SELECT task_id FROM jobs WHERE state = 'active')
                 ORDER BY priority DESC, id ASC
                 LIMIT 1",
                params![now_s],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query next job")?;

        let (id, task_id, priority, attempt, max_attempts, base_delay_ms) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        self.conn
            .execute(
                "UPDATE jobs SET state = 'active', claimed_at = ?1 WHERE id = ?2",
                params![now_s, id],
            )
            .context("Failed to mark job active")?;

        Ok(Some(JobRow {
            id,
            task_id: Uuid::parse_str(&task_id)
                .with_context(|| format!("Invalid task id in jobs table: '{}'", task_id))?,
            priority,
            attempt: attempt as u32,
            max_attempts: max_attempts as u32,
            base_delay_ms: base_delay_ms as u64,
        }))
    }

    /// Remove a job for good (successful completion or permanent failure).
    pub fn delete_job(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .context("Failed to delete job")?;
        Ok(())
    }

    /// Return a failed job to the queue with an incremented attempt counter,
    /// due again at `available_at`.
    pub fn retry_job(&self, id: i64, available_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET state = 'queued', attempt = attempt + 1, claimed_at = NULL, available_at = ?1
                 WHERE id = ?2",
                params![format_ts(available_at), id],
            )
            .context("Failed to requeue job")?;
        Ok(())
    }

    /// Re-queue active jobs claimed before `cutoff` (worker crashed or hung).
    /// Returns how many jobs were released.
    pub fn release_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'queued', claimed_at = NULL, available_at = ?1
                 WHERE state = 'active' AND claimed_at < ?1",
                params![format_ts(cutoff)],
            )
            .context("Failed to release stale jobs")?;
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn count_jobs(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .context("Failed to count jobs")
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading tasks from SQLite before converting
/// the status / type / repository strings into typed values.
struct TaskRow {
    id: String,
    owner: String,
    title: String,
    description: String,
    task_type: String,
    repository: String,
    status: String,
    progress: i64,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self, stages: Vec<Stage>, logs: Vec<LogEntry>) -> Result<Task> {
        let repository: Repository =
            serde_json::from_str(&self.repository).context("Corrupt repository JSON")?;
        Ok(Task {
            id: Uuid::parse_str(&self.id)
                .with_context(|| format!("Invalid task id in database: '{}'", self.id))?,
            owner: self.owner,
            title: self.title,
            description: self.description,
            task_type: TaskType::from_str(&self.task_type)
                .map_err(|e| anyhow::anyhow!("invalid task type in database: {}", e))?,
            repository,
            status: TaskStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!("invalid task status in database: {}", e))?,
            progress: self.progress as u8,
            stages,
            logs,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
