//! Workflow management service.
//!
//! The entry point collaborators use: submit a definition, poll its status,
//! fetch its result and audit trail, cancel or resume it. Execution happens
//! on spawned tasks, bounded by a semaphore of `max_concurrent_runs` permits,
//! so `submit` returns as soon as the run is stored.

use std::sync::Arc;

use dashmap::DashMap;
use orchestra_types::audit::{AuditRecord, VerificationReport};
use orchestra_types::workflow::{
    RunProgress, RunStatus, RunStatusView, StageStatus, WorkflowDefinition, WorkflowRun,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::repository::Stores;
use crate::repository::run::RunRepository;

use super::definition::validate_definition;
use super::executor::{ExecutionEngine, ExecutionResult, ExecutorError, WorkflowExecutor};

type RunHandle = JoinHandle<Result<ExecutionResult, ExecutorError>>;

/// Service owning the execution engine and the runs it has spawned.
pub struct WorkflowService<S: Stores> {
    engine: Arc<ExecutionEngine<S>>,
    permits: Arc<Semaphore>,
    handles: DashMap<Uuid, RunHandle>,
}

impl<S: Stores> WorkflowService<S> {
    pub fn new(engine: ExecutionEngine<S>) -> Self {
        let max_runs = engine.services().config.max_concurrent_runs.max(1);
        Self {
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(max_runs)),
            handles: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine<S> {
        &self.engine
    }

    /// Validate and store a run, then start executing it in the background.
    ///
    /// Validation errors surface here; nothing is stored for an invalid
    /// definition.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        owner_id: &str,
    ) -> Result<Uuid, OrchestrationError> {
        validate_definition(&definition)?;

        let run = WorkflowRun::queued(owner_id, definition, input);
        self.engine.services().runs.create_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            workflow = run.definition.name.as_str(),
            owner = owner_id,
            "workflow submitted"
        );

        self.spawn(run.run_id, false);
        Ok(run.run_id)
    }

    fn spawn(&self, run_id: Uuid, resume: bool) {
        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| ExecutorError::Join(e.to_string()))?;
            if resume {
                engine.resume(run_id).await
            } else {
                engine.execute(run_id).await
            }
        });
        // Finished runs nobody waited on would otherwise pile up here.
        self.handles.retain(|_, h| !h.is_finished());
        self.handles.insert(run_id, handle);
    }

    /// Wait for the background execution of a run started by this service.
    /// Runs it is not driving, and finished runs whose handle was pruned by a
    /// later submit, report their stored state.
    pub async fn wait(&self, run_id: Uuid) -> Result<ExecutionResult, OrchestrationError> {
        if let Some((_, handle)) = self.handles.remove(&run_id) {
            return match handle.await {
                Ok(result) => Ok(result?),
                Err(e) => Err(ExecutorError::Join(e.to_string()).into()),
            };
        }
        Ok(self.engine.snapshot(run_id).await?)
    }

    async fn load(&self, run_id: Uuid) -> Result<WorkflowRun, OrchestrationError> {
        self.engine
            .services()
            .runs
            .get_run(&run_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("run {run_id}")))
    }

    pub async fn status(&self, run_id: Uuid) -> Result<RunStatusView, OrchestrationError> {
        let run = self.load(run_id).await?;
        let stages = self.engine.services().runs.list_stages(&run_id).await?;

        let mut progress = RunProgress {
            total: run.definition.stages.len(),
            completed: 0,
            failed: 0,
            in_progress: 0,
            current_stage_ids: Vec::new(),
        };
        for stage in &stages {
            match stage.status {
                StageStatus::Completed => progress.completed += 1,
                StageStatus::Failed => progress.failed += 1,
                StageStatus::InProgress => {
                    progress.in_progress += 1;
                    progress.current_stage_ids.push(stage.stage_id.clone());
                }
                StageStatus::Queued => {}
            }
        }
        progress.current_stage_ids.sort();

        Ok(RunStatusView {
            run_id,
            status: run.status,
            progress,
            error_message: run.error_message,
        })
    }

    /// Output of a completed run.
    pub async fn result(&self, run_id: Uuid) -> Result<Value, OrchestrationError> {
        let run = self.load(run_id).await?;
        match run.status {
            RunStatus::Completed => Ok(run.output.unwrap_or(Value::Null)),
            RunStatus::Cancelled => Err(OrchestrationError::Cancelled(run_id)),
            RunStatus::Failed => {
                let stages = self.engine.services().runs.list_stages(&run_id).await?;
                match stages.into_iter().find(|s| s.status == StageStatus::Failed) {
                    Some(stage) => Err(OrchestrationError::StageFailed {
                        message: stage.error_message.unwrap_or_default(),
                        stage_id: stage.stage_id,
                    }),
                    None => Err(OrchestrationError::InvalidState {
                        run_id,
                        status: run.status,
                    }),
                }
            }
            status => Err(OrchestrationError::NotReady { run_id, status }),
        }
    }

    /// Audit records of a run, oldest first.
    pub async fn audit_trail(&self, run_id: Uuid) -> Result<Vec<AuditRecord>, OrchestrationError> {
        self.load(run_id).await?;
        Ok(self.engine.services().audit.trail(&run_id).await?)
    }

    pub async fn verify_audit(&self, run_id: Uuid) -> Result<VerificationReport, OrchestrationError> {
        self.load(run_id).await?;
        Ok(self.engine.services().audit.verify(&run_id).await?)
    }

    pub async fn cancel(&self, run_id: Uuid, requester: &str) -> Result<(), OrchestrationError> {
        let run = self.load(run_id).await?;
        authorize(&run, requester)?;
        self.engine.cancel(run_id).await?;
        Ok(())
    }

    /// Resume a paused run in the background.
    pub async fn resume(&self, run_id: Uuid, requester: &str) -> Result<(), OrchestrationError> {
        let run = self.load(run_id).await?;
        authorize(&run, requester)?;
        if run.status != RunStatus::Paused {
            return Err(OrchestrationError::InvalidState {
                run_id,
                status: run.status,
            });
        }
        self.spawn(run_id, true);
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, OrchestrationError> {
        Ok(self.engine.services().runs.list_runs(limit).await?)
    }
}

fn authorize(run: &WorkflowRun, requester: &str) -> Result<(), OrchestrationError> {
    if run.owner_id == requester {
        Ok(())
    } else {
        Err(OrchestrationError::Forbidden(format!(
            "run {} belongs to '{}'",
            run.run_id, run.owner_id
        )))
    }
}
