//! SQLite run repository.
//!
//! Runs keep a JSON snapshot of their definition. Status changes are a
//! single guarded `UPDATE ... WHERE status = ?`, so two writers racing on the
//! same run cannot both win.

use orchestra_core::repository::run::RunRepository;
use orchestra_types::error::RepositoryError;
use orchestra_types::workflow::{
    RunStatus, RunTransition, StageExecution, StageStatus, WorkflowDefinition, WorkflowRun,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, insert_err, parse_datetime, parse_enum, parse_json, parse_uuid, query_err,
    to_json,
};

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Read through the writer so a transition sees its own last write.
    async fn get_run_for_update(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        row.map(|r| RunRow::from_row(&r).map_err(query_err)?.into_run())
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    owner_id: String,
    definition: String,
    initial_input: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    output: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            owner_id: row.try_get("owner_id")?,
            definition: row.try_get("definition")?,
            initial_input: row.try_get("initial_input")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            output: row.try_get("output")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let definition: WorkflowDefinition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;

        Ok(WorkflowRun {
            run_id: parse_uuid(&self.run_id)?,
            owner_id: self.owner_id,
            definition,
            initial_input: parse_json(&self.initial_input, "initial_input")?,
            status: parse_enum(&self.status)?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error_message: self.error_message,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "output"))
                .transpose()?,
        })
    }
}

struct StageRow {
    run_id: String,
    stage_id: String,
    status: String,
    input: String,
    output: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    attempts: i64,
    cached: bool,
}

impl StageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            stage_id: row.try_get("stage_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            cached: row.try_get("cached")?,
        })
    }

    fn into_execution(self) -> Result<StageExecution, RepositoryError> {
        let status: StageStatus = parse_enum(&self.status)?;
        Ok(StageExecution {
            run_id: parse_uuid(&self.run_id)?,
            stage_id: self.stage_id,
            status,
            input: parse_json(&self.input, "stage input")?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "stage output"))
                .transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            execution_time_ms: self.execution_time_ms.map(|ms| ms.max(0) as u64),
            error_message: self.error_message,
            attempts: self.attempts.clamp(0, i64::from(u32::MAX)) as u32,
            cached: self.cached,
        })
    }
}

// ---------------------------------------------------------------------------
// RunRepository implementation
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(&run.definition)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, owner_id, workflow_name, definition, initial_input, status,
                created_at, started_at, completed_at, error_message, output)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.owner_id)
        .bind(&run.definition.name)
        .bind(&definition)
        .bind(to_json(&run.initial_input)?)
        .bind(run.status.as_str())
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(&run.error_message)
        .bind(run.output.as_ref().map(to_json).transpose()?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, || format!("run {} already exists", run.run_id)))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_err)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> Result<WorkflowRun, RepositoryError> {
        let current = self
            .get_run_for_update(run_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if !current.status.can_transition_to(transition.to) {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} cannot move from {} to {}",
                current.status, transition.to
            )));
        }

        let at = format_datetime(&transition.at);
        let started_at = (transition.to == RunStatus::InProgress).then_some(at.as_str());
        let completed_at = transition.to.is_terminal().then_some(at.as_str());
        let output = transition.output.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?,
                 started_at = COALESCE(started_at, ?),
                 completed_at = COALESCE(?, completed_at),
                 error_message = COALESCE(?, error_message),
                 output = COALESCE(?, output)
               WHERE run_id = ? AND status = ?"#,
        )
        .bind(transition.to.as_str())
        .bind(started_at)
        .bind(completed_at)
        .bind(&transition.error_message)
        .bind(&output)
        .bind(run_id.to_string())
        .bind(current.status.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} changed status concurrently"
            )));
        }

        self.get_run_for_update(run_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs ORDER BY created_at DESC, run_id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(query_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn save_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let output = stage.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO stage_executions
               (run_id, stage_id, status, input, output, started_at, completed_at,
                execution_time_ms, error_message, attempts, cached, seq)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM stage_executions WHERE run_id = ?))
               ON CONFLICT(run_id, stage_id) DO UPDATE SET
                 status = excluded.status,
                 input = excluded.input,
                 output = excluded.output,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 execution_time_ms = excluded.execution_time_ms,
                 error_message = excluded.error_message,
                 attempts = excluded.attempts,
                 cached = excluded.cached"#,
        )
        .bind(stage.run_id.to_string())
        .bind(&stage.stage_id)
        .bind(stage.status.as_str())
        .bind(to_json(&stage.input)?)
        .bind(&output)
        .bind(stage.started_at.as_ref().map(format_datetime))
        .bind(stage.completed_at.as_ref().map(format_datetime))
        .bind(stage.execution_time_ms.map(|ms| ms as i64))
        .bind(&stage.error_message)
        .bind(i64::from(stage.attempts))
        .bind(stage.cached)
        .bind(stage.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn list_stages(&self, run_id: &Uuid) -> Result<Vec<StageExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM stage_executions WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut stages = Vec::with_capacity(rows.len());
        for row in &rows {
            stages.push(StageRow::from_row(row).map_err(query_err)?.into_execution()?);
        }
        Ok(stages)
    }
}
