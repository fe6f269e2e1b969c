//! SQLite persistence for runs and steps.
//!
//! One pooled connection, WAL journaling. The single connection pins writes to
//! a single writer; HTTP readers and the executor share it, serialized by the
//! pool.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use cadence_core::{Id, Run, RunStatus, Step, StepPhase, StepStatus};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const RUNS_COLUMNS: &str = "id, wake_id, goal, context, constraints, status, summary, error, \
    started_at, completed_at, updated_at, created_at";

const STEPS_COLUMNS: &str = "id, run_id, step_num, phase, tool, tool_input, tool_output, \
    status, attempt, error, started_at, completed_at, created_at";

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (and create if needed) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;

        for pragma in [
            "PRAGMA foreign_keys = ON",
            "PRAGMA busy_timeout = 5000",
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
        ] {
            sqlx::query(pragma).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Run the embedded migrations. Idempotent.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migration = include_str!("../../../migrations/0001_init.sql");
        let cleaned: String = migration
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");

        for statement in cleaned.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // --- Run operations ---

    /// Create a run, idempotent by `wake_id`.
    ///
    /// Returns `(run, true)` when a run with the given wake id already exists.
    /// Concurrent callers racing on the same wake id all resolve to the single
    /// winning row; the `UNIQUE(wake_id)` constraint arbitrates.
    pub async fn create_run(
        &self,
        goal: &str,
        wake_id: Option<&str>,
        context: Option<&serde_json::Value>,
        constraints: Option<&serde_json::Value>,
    ) -> Result<(Run, bool)> {
        if let Some(wake_id) = wake_id {
            if let Some(existing) = self.get_run_by_wake_id(wake_id).await? {
                return Ok((existing, true));
            }
        }

        let now = Utc::now();
        let run = Run {
            id: Id::new(),
            wake_id: wake_id.map(str::to_string),
            goal: goal.to_string(),
            context: context.cloned(),
            constraints: constraints.cloned(),
            status: RunStatus::Queued,
            summary: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
            created_at: now,
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO runs (id, wake_id, goal, context, constraints, status, updated_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.wake_id.as_deref())
        .bind(&run.goal)
        .bind(run.context.as_ref().map(|v| v.to_string()))
        .bind(run.constraints.as_ref().map(|v| v.to_string()))
        .bind(run.status.as_str())
        .bind(fmt_time(now))
        .bind(fmt_time(now))
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok((run, false)),
            Err(e) if is_unique_violation(&e) => {
                // Lost the race on wake_id; the winner's row is authoritative.
                let wake_id = wake_id.ok_or(e)?;
                let winner = self
                    .get_run_by_wake_id(wake_id)
                    .await?
                    .ok_or_else(|| StorageError::RunNotFound(wake_id.to_string()))?;
                Ok((winner, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a run by id.
    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    /// Get a run by its wake id, if any.
    pub async fn get_run_by_wake_id(&self, wake_id: &str) -> Result<Option<Run>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE wake_id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(wake_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// List runs with the given status, oldest first. An unknown status value
    /// simply matches nothing.
    pub async fn list_runs_by_status(&self, status: &str) -> Result<Vec<Run>> {
        let query =
            format!("SELECT {RUNS_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// The oldest queued run, or None.
    pub async fn next_queued(&self) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(RunStatus::Queued.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// Update a run's status. `summary` and `error` are sticky: only written
    /// when non-None. `started_at` is set on the first transition into
    /// running, `completed_at` on the first terminal transition.
    pub async fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = fmt_time(Utc::now());
        let started_at = (status == RunStatus::Running).then(|| now.clone());
        let completed_at = status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?1, summary = COALESCE(?2, summary),
                error = COALESCE(?3, error),
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(completed_at, ?5),
                updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(status.as_str())
        .bind(summary)
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Step operations ---

    /// Append a step with `status=pending`, `attempt=1`.
    pub async fn append_step(
        &self,
        run_id: &str,
        step_num: i64,
        phase: StepPhase,
        tool: Option<&str>,
        tool_input: Option<&serde_json::Value>,
    ) -> Result<Step> {
        let now = Utc::now();
        let step = Step {
            id: Id::new(),
            run_id: Id::from_string(run_id),
            step_num,
            phase,
            tool: tool.map(str::to_string),
            tool_input: tool_input.cloned(),
            tool_output: None,
            status: StepStatus::Pending,
            attempt: 1,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO steps (id, run_id, step_num, phase, tool, tool_input, status, attempt, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(step.id.as_ref())
        .bind(run_id)
        .bind(step.step_num)
        .bind(step.phase.as_str())
        .bind(step.tool.as_deref())
        .bind(step.tool_input.as_ref().map(|v| v.to_string()))
        .bind(step.status.as_str())
        .bind(step.attempt)
        .bind(fmt_time(now))
        .execute(&self.pool)
        .await?;

        Ok(step)
    }

    /// Update a step's status. `tool_output` and `error` are sticky; `attempt`
    /// overwrites. `started_at` is set on entry to running, `completed_at` on
    /// `ok`/`error`.
    pub async fn update_step_status(
        &self,
        id: &str,
        status: StepStatus,
        tool_output: Option<&serde_json::Value>,
        error: Option<&str>,
        attempt: i64,
    ) -> Result<()> {
        let now = fmt_time(Utc::now());
        let started_at = (status == StepStatus::Running).then(|| now.clone());
        let completed_at =
            matches!(status, StepStatus::Ok | StepStatus::Error).then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE steps SET status = ?1, tool_output = COALESCE(?2, tool_output),
                error = COALESCE(?3, error),
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(completed_at, ?5),
                attempt = ?6
            WHERE id = ?7
            "#,
        )
        .bind(status.as_str())
        .bind(tool_output.map(|v| v.to_string()))
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .bind(attempt)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StepNotFound(id.to_string()));
        }
        Ok(())
    }

    /// All steps of a run, ordered by `step_num`.
    pub async fn steps_by_run(&self, run_id: &str) -> Result<Vec<Step>> {
        let query =
            format!("SELECT {STEPS_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_num ASC");
        let rows = sqlx::query_as::<_, StepRow>(&query)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    /// Highest `step_num` for a run, 0 when it has no steps.
    pub async fn max_step_num(&self, run_id: &str) -> Result<i64> {
        let max: (Option<i64>,) = sqlx::query_as("SELECT MAX(step_num) FROM steps WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(max.0.unwrap_or(0))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_json(s: Option<String>) -> Result<Option<serde_json::Value>> {
    match s {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
        _ => Ok(None),
    }
}

// --- Row types ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    wake_id: Option<String>,
    goal: String,
    context: Option<String>,
    constraints: Option<String>,
    status: String,
    summary: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    created_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: Id::from_string(self.id),
            wake_id: self.wake_id,
            goal: self.goal,
            context: parse_json(self.context)?,
            constraints: parse_json(self.constraints)?,
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            summary: self.summary,
            error: self.error,
            started_at: self.started_at.as_deref().and_then(parse_time),
            completed_at: self.completed_at.as_deref().and_then(parse_time),
            updated_at: parse_time(&self.updated_at).unwrap_or_default(),
            created_at: parse_time(&self.created_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    step_num: i64,
    phase: String,
    tool: Option<String>,
    tool_input: Option<String>,
    tool_output: Option<String>,
    status: String,
    attempt: i64,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        Ok(Step {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            step_num: self.step_num,
            phase: StepPhase::parse(&self.phase).unwrap_or(StepPhase::Frame),
            tool: self.tool,
            tool_input: parse_json(self.tool_input)?,
            tool_output: parse_json(self.tool_output)?,
            status: StepStatus::parse(&self.status).unwrap_or(StepStatus::Error),
            attempt: self.attempt,
            error: self.error,
            started_at: self.started_at.as_deref().and_then(parse_time),
            completed_at: self.completed_at.as_deref().and_then(parse_time),
            created_at: parse_time(&self.created_at).unwrap_or_default(),
        })
    }
}
