//! Execution engine: level-by-level parallel stage dispatch.
//!
//! The `ExecutionEngine` walks a run's dependency levels. Stages within a
//! level run concurrently on a `tokio::task::JoinSet`; the next level only
//! starts once every stage of the current one has finished, so a stage sees
//! all outputs of earlier levels and none from its own.
//!
//! # Stage dispatch
//!
//! 1. Result cache lookup (a hit completes the stage without dispatch).
//! 2. Budget check against the stage's scope and cost estimate.
//! 3. Resource lock, if the stage claims one.
//! 4. Provider invocation with timeout and retries, one audit record per attempt.
//! 5. On success: record spend, write the cache, release the lock.
//!
//! After each level barrier the engine fails the run on any stage failure,
//! pauses it if a budget asked for a pause, and stops if cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use orchestra_types::audit::{AuditAction, AuditEntry};
use orchestra_types::budget::{BudgetAction, BudgetScope};
use orchestra_types::config::{EngineConfig, OrchestraConfig};
use orchestra_types::error::RepositoryError;
use orchestra_types::event::WorkflowEvent;
use orchestra_types::lock::{ConflictStrategy, LockConflict};
use orchestra_types::workflow::{
    RunStatus, RunTransition, StageDefinition, StageExecution, StageStatus, WorkflowRun,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::budget::BudgetEnforcer;
use crate::cache::ResultCache;
use crate::canonical::content_hash;
use crate::error::OrchestrationError;
use crate::event::bus::EventBus;
use crate::lock::{LockAcquisition, LockError, LockManager, LockRequest};
use crate::provider::ProviderError;
use crate::provider::registry::ProviderRegistry;
use crate::repository::Stores;
use crate::repository::run::RunRepository;

use super::context::RunContext;
use super::graph::{GraphError, build_levels, topological_order};
use super::retry::RetryPolicy;
use super::template::resolve_input;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a stored `Queued` run from its first level.
    fn execute(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Continue a `Paused` run, skipping stages that already completed.
    fn resume(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Cancel a run. In-flight stages finish; undispatched ones stay queued.
    fn cancel(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Outcome of one `execute` or `resume` call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// `Completed`, `Failed`, `Paused`, or `Cancelled`.
    pub status: RunStatus,
    /// Terminal stage output when `Completed`.
    pub output: Option<Value>,
    /// Names the failing stage and root cause when `Failed`.
    pub error: Option<String>,
    pub stages: Vec<StageExecution>,
    /// Lock conflicts stages ran into, in level order.
    pub conflicts: Vec<LockConflict>,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} is {status}")]
    InvalidState { run_id: Uuid, status: RunStatus },

    #[error("invalid workflow: {0}")]
    Definition(#[from] GraphError),

    #[error("run store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("stage task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// EngineServices
// ---------------------------------------------------------------------------

/// Shared handles every stage task needs. Cloning is cheap.
pub struct EngineServices<S: Stores> {
    pub runs: Arc<S::Runs>,
    pub locks: Arc<LockManager<S::Locks>>,
    pub budgets: Arc<BudgetEnforcer<S::Budgets>>,
    pub cache: Arc<ResultCache<S::Kv>>,
    pub audit: Arc<AuditTrail<S::Audit>>,
    pub providers: Arc<ProviderRegistry>,
    pub events: EventBus,
    pub config: Arc<EngineConfig>,
}

impl<S: Stores> Clone for EngineServices<S> {
    fn clone(&self) -> Self {
        Self {
            runs: Arc::clone(&self.runs),
            locks: Arc::clone(&self.locks),
            budgets: Arc::clone(&self.budgets),
            cache: Arc::clone(&self.cache),
            audit: Arc::clone(&self.audit),
            providers: Arc::clone(&self.providers),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: Stores> EngineServices<S> {
    /// Wire the coordination services over one set of stores.
    pub fn new(
        runs: S::Runs,
        locks: S::Locks,
        budgets: S::Budgets,
        audit: AuditTrail<S::Audit>,
        kv: S::Kv,
        providers: ProviderRegistry,
        config: &OrchestraConfig,
    ) -> Self {
        Self {
            runs: Arc::new(runs),
            locks: Arc::new(LockManager::new(
                locks,
                Duration::from_millis(config.engine.lock_poll_interval_ms),
            )),
            budgets: Arc::new(BudgetEnforcer::new(budgets)),
            cache: Arc::new(ResultCache::new(kv, &config.cache)),
            audit: Arc::new(audit),
            providers: Arc::new(providers),
            events: EventBus::new(config.events.capacity),
            config: Arc::new(config.engine.clone()),
        }
    }
}

/// How a stage task ended.
#[derive(Debug)]
enum Disposition {
    Completed,
    Failed(String),
    /// Budget `Pause`: not dispatched, left `Queued`.
    Paused(String),
    /// Cancelled before dispatch, left `Queued`.
    Skipped,
}

#[derive(Debug)]
struct StageReport {
    execution: StageExecution,
    disposition: Disposition,
    conflict: Option<LockConflict>,
    /// Cost to record against the stage's budget scope.
    spend_cents: Option<u64>,
}

impl StageReport {
    fn new(execution: StageExecution, disposition: Disposition) -> Self {
        Self {
            execution,
            disposition,
            conflict: None,
            spend_cents: None,
        }
    }
}

/// How the level loop ended.
enum LevelsOutcome {
    Completed(Value),
    Failed(String),
    Paused(String),
    Cancelled,
}

impl<S: Stores> EngineServices<S> {
    /// Run one stage to completion. Only store failures surface as `Err`.
    async fn run_stage(
        &self,
        run_id: Uuid,
        workflow_name: String,
        stage: StageDefinition,
        mut exec: StageExecution,
        token: CancellationToken,
    ) -> Result<StageReport, ExecutorError> {
        if token.is_cancelled() {
            tracing::debug!(run_id = %run_id, stage_id = stage.id.as_str(), "skipping stage: run cancelled");
            return Ok(StageReport::new(exec, Disposition::Skipped));
        }

        let stage_start = Instant::now();
        let input_hash = content_hash(&exec.input);

        // 1. Cache
        if let Some(entry) = self.cache.get(&stage.capability, &exec.input).await {
            let now = Utc::now();
            exec.status = StageStatus::Completed;
            exec.output = Some(entry.output.clone());
            exec.cached = true;
            exec.attempts = 0;
            exec.started_at = Some(now);
            exec.completed_at = Some(now);
            exec.execution_time_ms = Some(0);
            self.runs.save_stage(&exec).await?;

            self.audit_attempt(AuditEntry {
                run_id,
                stage_id: stage.id.clone(),
                agent_id: entry.agent_id.clone(),
                action: AuditAction::Execute,
                input_hash: Some(input_hash),
                output_hash: Some(content_hash(&entry.output)),
                status: "cache_hit".to_string(),
                attempt: 0,
            })
            .await;
            self.events.publish(WorkflowEvent::StageCompleted {
                run_id,
                stage_id: stage.id.clone(),
                duration_ms: 0,
                cached: true,
            });
            return Ok(StageReport::new(exec, Disposition::Completed));
        }

        // 2. Budget
        let (scope, scope_id) = match &stage.budget {
            Some(b) => (b.scope, b.scope_id.clone()),
            None => (BudgetScope::Workflow, workflow_name.clone()),
        };
        let estimate = stage.estimated_cost_cents.unwrap_or(0);
        let check = match self.budgets.check(scope, &scope_id, estimate).await {
            Ok(check) => check,
            Err(e) => {
                let message = format!("budget check failed: {e}");
                return self.fail_before_dispatch(exec, message).await;
            }
        };
        if !check.allowed {
            let action = check.action.unwrap_or(BudgetAction::Kill);
            self.events.publish(WorkflowEvent::BudgetExceeded {
                run_id,
                stage_id: stage.id.clone(),
                scope,
                scope_id: scope_id.clone(),
                usage_percent: check.usage_percent,
                action,
            });
            let reason = check.reason.clone().unwrap_or_default();
            match action {
                BudgetAction::Notify => {
                    tracing::warn!(
                        run_id = %run_id,
                        stage_id = stage.id.as_str(),
                        usage_percent = check.usage_percent,
                        "budget exceeded; proceeding under notify policy"
                    );
                }
                BudgetAction::Pause => {
                    tracing::info!(run_id = %run_id, stage_id = stage.id.as_str(), %reason, "budget pause");
                    return Ok(StageReport::new(exec, Disposition::Paused(reason)));
                }
                BudgetAction::Kill => {
                    let err = OrchestrationError::BudgetExceeded {
                        scope,
                        scope_id,
                        usage_percent: check.usage_percent,
                    };
                    return self.fail_before_dispatch(exec, err.to_string()).await;
                }
            }
        }

        exec.status = StageStatus::InProgress;
        exec.started_at = Some(Utc::now());
        self.runs.save_stage(&exec).await?;

        // 3. Lock
        let mut held_lock = None;
        if let Some(claim) = &stage.resource {
            let ttl = Duration::from_millis(claim.ttl_ms.unwrap_or(self.config.default_lock_ttl_ms));
            let mut request = LockRequest::new(
                claim.resource_type.clone(),
                claim.resource_id.clone(),
                format!("{run_id}:{}", stage.id),
                ttl,
            )
            .with_strategy(claim.strategy);
            request.content_hash = claim.content_hash.clone();

            let acquired = if claim.strategy == ConflictStrategy::Queue {
                let max_wait = Duration::from_millis(
                    stage
                        .timeout_ms
                        .or(self.config.default_stage_timeout_ms)
                        .unwrap_or(self.config.lock_queue_max_wait_ms),
                );
                self.locks
                    .acquire_waiting(&request, max_wait)
                    .await
                    .map(LockAcquisition::Acquired)
            } else {
                self.locks.acquire(&request).await
            };

            match acquired {
                Ok(LockAcquisition::Acquired(lock)) => held_lock = Some(lock),
                Ok(LockAcquisition::Conflict(conflict)) => {
                    self.events.publish(WorkflowEvent::LockConflict {
                        run_id,
                        stage_id: stage.id.clone(),
                        conflict: conflict.clone(),
                    });
                    if conflict.strategy.is_advisory() {
                        return self.complete_with_conflict(exec, conflict, stage_start).await;
                    }
                    let message = OrchestrationError::from(conflict.clone()).to_string();
                    let mut report = self.finish_failed(exec, message, stage_start).await?;
                    report.conflict = Some(conflict);
                    return Ok(report);
                }
                Err(e @ LockError::WaitTimedOut { .. }) => {
                    return self.finish_failed(exec, e.to_string(), stage_start).await;
                }
                Err(e) => {
                    return self
                        .finish_failed(exec, format!("lock acquisition failed: {e}"), stage_start)
                        .await;
                }
            }
        }

        // 4. Invoke
        let report = self
            .invoke_with_retries(run_id, &stage, exec, input_hash, stage_start)
            .await;

        // 5. Release
        if let Some(lock) = held_lock {
            if let Err(e) = self.locks.release(&lock.lock_id, &lock.owner_id).await {
                tracing::warn!(run_id = %run_id, lock_id = %lock.lock_id, error = %e, "lock release failed");
            }
        }

        let report = report?;
        if matches!(report.disposition, Disposition::Completed) {
            self.after_success(run_id, &stage, &report, scope, &scope_id)
                .await;
        }
        Ok(report)
    }

    async fn invoke_with_retries(
        &self,
        run_id: Uuid,
        stage: &StageDefinition,
        mut exec: StageExecution,
        input_hash: String,
        stage_start: Instant,
    ) -> Result<StageReport, ExecutorError> {
        let Some(provider) = self.providers.get(&stage.capability) else {
            let message = format!("no provider registered for capability '{}'", stage.capability);
            exec.attempts = 1;
            self.audit_attempt(AuditEntry {
                run_id,
                stage_id: stage.id.clone(),
                agent_id: stage.capability.clone(),
                action: AuditAction::Fail,
                input_hash: Some(input_hash),
                output_hash: None,
                status: "failed".to_string(),
                attempt: 1,
            })
            .await;
            self.events.publish(WorkflowEvent::StageFailed {
                run_id,
                stage_id: stage.id.clone(),
                error: message.clone(),
                will_retry: false,
            });
            return self.finish_failed(exec, message, stage_start).await;
        };

        let policy = RetryPolicy::for_stage(stage, &self.config);
        let timeout = stage
            .timeout_ms
            .or(self.config.default_stage_timeout_ms)
            .map(Duration::from_millis);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            exec.attempts = attempt;
            self.events.publish(WorkflowEvent::StageStarted {
                run_id,
                stage_id: stage.id.clone(),
                capability: stage.capability.clone(),
                attempt,
            });

            let call = provider.invoke(&stage.capability, &exec.input);
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(ProviderError::transient(format!(
                        "provider timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
                None => call.await,
            };
            let action = if attempt == 1 {
                AuditAction::Execute
            } else {
                AuditAction::Retry
            };

            match result {
                Ok(response) => {
                    self.audit_attempt(AuditEntry {
                        run_id,
                        stage_id: stage.id.clone(),
                        agent_id: provider.name().to_string(),
                        action,
                        input_hash: Some(input_hash.clone()),
                        output_hash: Some(content_hash(&response.output)),
                        status: "succeeded".to_string(),
                        attempt,
                    })
                    .await;

                    let elapsed_ms = stage_start.elapsed().as_millis() as u64;
                    exec.status = StageStatus::Completed;
                    exec.output = Some(response.output);
                    exec.completed_at = Some(Utc::now());
                    exec.execution_time_ms = Some(elapsed_ms);
                    exec.error_message = None;
                    self.runs.save_stage(&exec).await?;

                    let mut report = StageReport::new(exec, Disposition::Completed);
                    // Provider-reported cost replaces the estimate.
                    report.spend_cents = response.cost_cents.or(stage.estimated_cost_cents);
                    return Ok(report);
                }
                Err(e) => {
                    let will_retry = policy.should_retry(attempt, e.retryable);
                    self.audit_attempt(AuditEntry {
                        run_id,
                        stage_id: stage.id.clone(),
                        agent_id: provider.name().to_string(),
                        action: if will_retry { action } else { AuditAction::Fail },
                        input_hash: Some(input_hash.clone()),
                        output_hash: None,
                        status: "failed".to_string(),
                        attempt,
                    })
                    .await;
                    self.events.publish(WorkflowEvent::StageFailed {
                        run_id,
                        stage_id: stage.id.clone(),
                        error: e.message.clone(),
                        will_retry,
                    });

                    if !will_retry {
                        tracing::warn!(
                            run_id = %run_id,
                            stage_id = stage.id.as_str(),
                            attempt,
                            error = %e,
                            "stage failed"
                        );
                        return self.finish_failed(exec, e.message, stage_start).await;
                    }

                    let delay = policy.backoff_delay(attempt);
                    tracing::debug!(
                        run_id = %run_id,
                        stage_id = stage.id.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying stage"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Spend, cache write, and completion event for a dispatched stage.
    async fn after_success(
        &self,
        run_id: Uuid,
        stage: &StageDefinition,
        report: &StageReport,
        scope: BudgetScope,
        scope_id: &str,
    ) {
        let exec = &report.execution;
        let Some(output) = &exec.output else {
            return;
        };

        if let Some(cost) = report.spend_cents.filter(|c| *c > 0) {
            match self.budgets.record_spend(scope, scope_id, cost).await {
                Ok(Some(outcome)) if outcome.alert_triggered => {
                    self.events.publish(WorkflowEvent::BudgetThresholdReached {
                        scope,
                        scope_id: scope_id.to_string(),
                        current_spend_cents: outcome.budget.current_spend_cents,
                        max_cost_cents: outcome.budget.max_cost_cents,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(run_id = %run_id, stage_id = stage.id.as_str(), error = %e, "recording spend failed")
                }
            }
        }

        let agent_id = self
            .providers
            .get(&stage.capability)
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| stage.capability.clone());
        self.cache
            .put(&stage.capability, &exec.input, output, &agent_id, None)
            .await;

        self.events.publish(WorkflowEvent::StageCompleted {
            run_id,
            stage_id: stage.id.clone(),
            duration_ms: exec.execution_time_ms.unwrap_or(0),
            cached: false,
        });
    }

    /// Advisory lock conflict: complete with a conflict descriptor instead
    /// of invoking the provider.
    async fn complete_with_conflict(
        &self,
        mut exec: StageExecution,
        conflict: LockConflict,
        stage_start: Instant,
    ) -> Result<StageReport, ExecutorError> {
        exec.status = StageStatus::Completed;
        exec.output = Some(json!({
            "conflict": {
                "strategy": conflict.strategy.as_str(),
                "resource_type": conflict.resource_type,
                "resource_id": conflict.resource_id,
                "held_by": conflict.held_by,
                "lock_id": conflict.holder_lock_id.to_string(),
            }
        }));
        exec.completed_at = Some(Utc::now());
        exec.execution_time_ms = Some(stage_start.elapsed().as_millis() as u64);
        self.runs.save_stage(&exec).await?;

        self.events.publish(WorkflowEvent::StageCompleted {
            run_id: exec.run_id,
            stage_id: exec.stage_id.clone(),
            duration_ms: exec.execution_time_ms.unwrap_or(0),
            cached: false,
        });
        let mut report = StageReport::new(exec, Disposition::Completed);
        report.conflict = Some(conflict);
        Ok(report)
    }

    async fn fail_before_dispatch(
        &self,
        mut exec: StageExecution,
        message: String,
    ) -> Result<StageReport, ExecutorError> {
        exec.started_at.get_or_insert_with(Utc::now);
        self.finish_failed(exec, message, Instant::now()).await
    }

    async fn finish_failed(
        &self,
        mut exec: StageExecution,
        message: String,
        stage_start: Instant,
    ) -> Result<StageReport, ExecutorError> {
        exec.status = StageStatus::Failed;
        exec.error_message = Some(message.clone());
        exec.completed_at = Some(Utc::now());
        exec.execution_time_ms = Some(stage_start.elapsed().as_millis() as u64);
        self.runs.save_stage(&exec).await?;
        Ok(StageReport::new(exec, Disposition::Failed(message)))
    }

    /// Audit writes never fail a stage.
    async fn audit_attempt(&self, entry: AuditEntry) {
        let run_id = entry.run_id;
        if let Err(e) = self.audit.log(entry).await {
            tracing::warn!(run_id = %run_id, error = %e, "audit append failed");
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine<S: Stores> {
    services: EngineServices<S>,
    /// Cancellation tokens of runs currently executing.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: Stores> ExecutionEngine<S> {
    pub fn new(services: EngineServices<S>) -> Self {
        Self {
            services,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn services(&self) -> &EngineServices<S> {
        &self.services
    }

    /// Stored state of a run, shaped like an execution result.
    pub async fn snapshot(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let run = self.load_run(run_id).await?;
        self.result_for(&run, Vec::new()).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, ExecutorError> {
        self.services
            .runs
            .get_run(&run_id)
            .await?
            .ok_or(ExecutorError::RunNotFound(run_id))
    }

    /// Move a run into `InProgress` and drive its remaining levels.
    async fn start(
        &self,
        run: WorkflowRun,
        ctx: RunContext,
        completed: HashSet<String>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = run.run_id;
        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, token.clone());

        let started = self
            .services
            .runs
            .transition_run(&run_id, &RunTransition::to(RunStatus::InProgress))
            .await;
        let run = match started {
            Ok(run) => run,
            Err(RepositoryError::Conflict(_)) => {
                // Lost the race against a cancel (or another executor).
                self.cancellation_tokens.remove(&run_id);
                let current = self.load_run(run_id).await?;
                if current.status == RunStatus::Cancelled {
                    return self.result_for(&current, Vec::new()).await;
                }
                return Err(ExecutorError::InvalidState {
                    run_id,
                    status: current.status,
                });
            }
            Err(e) => {
                self.cancellation_tokens.remove(&run_id);
                return Err(e.into());
            }
        };

        self.services.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: run.definition.name.clone(),
            total_stages: run.definition.stages.len(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = run.definition.name.as_str(),
            stages = run.definition.stages.len(),
            resumed = !completed.is_empty(),
            "starting workflow execution"
        );

        let driven = self.drive(&run, ctx, &completed, &token).await;
        self.cancellation_tokens.remove(&run_id);

        match driven {
            Ok((outcome, conflicts)) => self.finish(&run, outcome, conflicts).await,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(run_id = %run_id, error = %message, "workflow execution aborted");
                if let Err(store_err) = self
                    .services
                    .runs
                    .transition_run(&run_id, &RunTransition::to(RunStatus::Failed).with_error(&message))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %store_err, "marking aborted run failed");
                }
                self.services.events.publish(WorkflowEvent::RunFailed {
                    run_id,
                    workflow_name: run.definition.name.clone(),
                    error: message,
                });
                self.services.audit.close_run(&run_id);
                Err(e)
            }
        }
    }

    /// Walk the levels. Returns how the walk ended and the lock conflicts seen.
    async fn drive(
        &self,
        run: &WorkflowRun,
        mut ctx: RunContext,
        completed: &HashSet<String>,
        token: &CancellationToken,
    ) -> Result<(LevelsOutcome, Vec<LockConflict>), ExecutorError> {
        let run_id = run.run_id;
        // Own the stage definitions so spawned tasks don't borrow `run`.
        let levels: Vec<Vec<StageDefinition>> = build_levels(&run.definition.stages)?
            .into_iter()
            .map(|level| level.into_iter().cloned().collect())
            .collect();
        let mut conflicts = Vec::new();

        for (level_idx, level) in levels.into_iter().enumerate() {
            if token.is_cancelled() {
                return Ok((LevelsOutcome::Cancelled, conflicts));
            }

            let pending: Vec<StageDefinition> = level
                .into_iter()
                .filter(|s| !completed.contains(&s.id))
                .collect();
            if pending.is_empty() {
                continue;
            }
            let order: Vec<String> = pending.iter().map(|s| s.id.clone()).collect();

            self.services.events.publish(WorkflowEvent::LevelStarted {
                run_id,
                level: level_idx,
                stage_ids: order.clone(),
            });
            tracing::debug!(run_id = %run_id, level = level_idx, stages = order.len(), "processing level");

            let mut join_set = JoinSet::new();
            for stage in pending {
                let input = resolve_input(&stage.input, &ctx);
                let exec = StageExecution::queued(run_id, stage.id.clone(), input);
                self.services.runs.save_stage(&exec).await?;

                let services = self.services.clone();
                let workflow_name = run.definition.name.clone();
                let token = token.clone();
                join_set.spawn(async move {
                    services
                        .run_stage(run_id, workflow_name, stage, exec, token)
                        .await
                });
            }

            // Barrier: collect the whole level before touching the context.
            let mut reports: HashMap<String, StageReport> = HashMap::with_capacity(order.len());
            while let Some(joined) = join_set.join_next().await {
                let report = joined.map_err(|e| ExecutorError::Join(e.to_string()))??;
                reports.insert(report.execution.stage_id.clone(), report);
            }

            let mut first_failure = None;
            let mut pause_reason = None;
            for stage_id in &order {
                let Some(report) = reports.remove(stage_id) else {
                    continue;
                };
                conflicts.extend(report.conflict);
                match report.disposition {
                    Disposition::Completed => {
                        if let Some(output) = report.execution.output {
                            ctx.set_stage_output(stage_id.clone(), output);
                        }
                    }
                    Disposition::Failed(cause) => {
                        first_failure.get_or_insert_with(|| format!("stage '{stage_id}' failed: {cause}"));
                    }
                    Disposition::Paused(reason) => {
                        pause_reason.get_or_insert_with(|| format!("stage '{stage_id}' paused: {reason}"));
                    }
                    Disposition::Skipped => {}
                }
            }

            if let Some(message) = first_failure {
                return Ok((LevelsOutcome::Failed(message), conflicts));
            }
            if let Some(reason) = pause_reason {
                return Ok((LevelsOutcome::Paused(reason), conflicts));
            }
            if token.is_cancelled() {
                return Ok((LevelsOutcome::Cancelled, conflicts));
            }
        }

        let terminal = match &run.definition.terminal_stage {
            Some(id) => Some(id.clone()),
            None => topological_order(&run.definition.stages)?
                .last()
                .map(|s| s.id.clone()),
        };
        let output = terminal
            .and_then(|id| ctx.stage_output(&id).cloned())
            .unwrap_or(Value::Null);
        Ok((LevelsOutcome::Completed(output), conflicts))
    }

    /// Persist the final run status and publish the matching event.
    async fn finish(
        &self,
        run: &WorkflowRun,
        outcome: LevelsOutcome,
        conflicts: Vec<LockConflict>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = run.run_id;
        let workflow_name = run.definition.name.clone();
        let elapsed_ms = run
            .started_at
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let transition = match &outcome {
            LevelsOutcome::Completed(output) => {
                RunTransition::to(RunStatus::Completed).with_output(output.clone())
            }
            LevelsOutcome::Failed(message) => RunTransition::to(RunStatus::Failed).with_error(message),
            LevelsOutcome::Paused(reason) => RunTransition::to(RunStatus::Paused).with_error(reason),
            LevelsOutcome::Cancelled => RunTransition::to(RunStatus::Cancelled),
        };
        let stored = self.services.runs.transition_run(&run_id, &transition).await?;

        match outcome {
            LevelsOutcome::Completed(_) => {
                let stages_completed = self
                    .services
                    .runs
                    .list_stages(&run_id)
                    .await?
                    .iter()
                    .filter(|s| s.status == StageStatus::Completed)
                    .count();
                tracing::info!(run_id = %run_id, duration_ms = elapsed_ms, "workflow completed");
                self.services.events.publish(WorkflowEvent::RunCompleted {
                    run_id,
                    workflow_name,
                    duration_ms: elapsed_ms,
                    stages_completed,
                });
            }
            LevelsOutcome::Failed(error) => {
                tracing::warn!(run_id = %run_id, error = %error, "workflow failed");
                self.services.events.publish(WorkflowEvent::RunFailed {
                    run_id,
                    workflow_name,
                    error,
                });
            }
            LevelsOutcome::Paused(reason) => {
                tracing::info!(run_id = %run_id, reason = %reason, "workflow paused");
                self.services
                    .events
                    .publish(WorkflowEvent::RunPaused { run_id, reason });
            }
            LevelsOutcome::Cancelled => {
                tracing::info!(run_id = %run_id, "workflow cancelled");
                self.services.events.publish(WorkflowEvent::RunCancelled { run_id });
            }
        }
        if stored.status.is_terminal() {
            self.services.audit.close_run(&run_id);
        }

        self.result_for(&stored, conflicts).await
    }

    async fn result_for(
        &self,
        run: &WorkflowRun,
        conflicts: Vec<LockConflict>,
    ) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult {
            run_id: run.run_id,
            status: run.status,
            output: run.output.clone(),
            // A resumed run keeps its old pause reason on the row.
            error: run
                .error_message
                .clone()
                .filter(|_| matches!(run.status, RunStatus::Failed | RunStatus::Paused)),
            stages: self.services.runs.list_stages(&run.run_id).await?,
            conflicts,
        })
    }
}

impl<S: Stores> WorkflowExecutor for ExecutionEngine<S> {
    async fn execute(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Queued => {}
            RunStatus::Cancelled => return self.result_for(&run, Vec::new()).await,
            status => return Err(ExecutorError::InvalidState { run_id, status }),
        }
        let ctx = RunContext::new(run_id, run.definition.name.clone(), run.initial_input.clone());
        self.start(run, ctx, HashSet::new()).await
    }

    async fn resume(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(ExecutorError::InvalidState {
                run_id,
                status: run.status,
            });
        }

        let mut ctx = RunContext::new(run_id, run.definition.name.clone(), run.initial_input.clone());
        let mut completed = HashSet::new();
        for stage in self.services.runs.list_stages(&run_id).await? {
            if stage.status == StageStatus::Completed {
                if let Some(output) = stage.output {
                    ctx.set_stage_output(stage.stage_id.clone(), output);
                }
                completed.insert(stage.stage_id);
            }
        }
        tracing::info!(run_id = %run_id, completed = completed.len(), "resuming paused run");
        self.start(run, ctx, completed).await
    }

    async fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        // Two passes: a queued run may start executing between the token
        // lookup and the status transition.
        for _ in 0..2 {
            if let Some(token) = self.cancellation_tokens.get(&run_id) {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                return Ok(());
            }

            let run = self.load_run(run_id).await?;
            if run.status.is_terminal() {
                return Err(ExecutorError::InvalidState {
                    run_id,
                    status: run.status,
                });
            }
            match self
                .services
                .runs
                .transition_run(&run_id, &RunTransition::to(RunStatus::Cancelled))
                .await
            {
                Ok(_) => {
                    self.services.events.publish(WorkflowEvent::RunCancelled { run_id });
                    self.services.audit.close_run(&run_id);
                    return Ok(());
                }
                Err(RepositoryError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let run = self.load_run(run_id).await?;
        Err(ExecutorError::InvalidState {
            run_id,
            status: run.status,
        })
    }
}
