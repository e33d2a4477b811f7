//! Workflow domain types for Orchestra.
//!
//! `WorkflowDefinition` is the declarative graph a user submits. `WorkflowRun`
//! and `StageExecution` track one execution of that graph; both are owned by
//! the execution engine and only move forward through their status machines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::BudgetScope;
use crate::lock::ConflictStrategy;

/// Stage ID reserved for the template root (`workflow.input.*`).
pub const RESERVED_STAGE_ID: &str = "workflow";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative stage graph. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name. Also the default budget scope id.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stage whose output becomes the run output. Defaults to the last stage
    /// in topological order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_stage: Option<String>,
    /// Stage list forming the dependency graph.
    pub stages: Vec<StageDefinition>,
}

// ---------------------------------------------------------------------------
// Stage Definition
// ---------------------------------------------------------------------------

/// A single unit of work bound to a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique within the graph.
    pub id: String,
    /// Capability name dispatched to the provider registry.
    pub capability: String,
    /// Input template. String leaves may contain `${path}` or `{{ path }}`.
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,
    /// Stage IDs that must complete before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-attempt timeout in milliseconds (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Re-attempts after the first failure (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Cost charged against the budget when the provider reports none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_cents: Option<u64>,
    /// Budget scope override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetRef>,
    /// Contended resource that must be locked during dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceClaim>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl StageDefinition {
    /// Minimal stage with an empty input and no dependencies.
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            input: empty_object(),
            dependencies: Vec::new(),
            timeout_ms: None,
            max_retries: None,
            estimated_cost_cents: None,
            budget: None,
            resource: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Which budget a stage charges against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRef {
    pub scope: BudgetScope,
    pub scope_id: String,
}

/// A named resource a stage must hold a lock on while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Status of a workflow run.
///
/// Transitions only move forward; `Paused -> InProgress` is the one
/// re-entry and happens on explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, InProgress | Failed | Cancelled) => true,
            (InProgress, Paused | Completed | Failed | Cancelled) => true,
            (Paused, InProgress | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid stage status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution tracking
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    /// Submitting user. Management operations check against this.
    pub owner_id: String,
    /// Snapshot of the definition at submission time.
    pub definition: WorkflowDefinition,
    pub initial_input: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Names the failing stage and root cause when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Output of the terminal stage once `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl WorkflowRun {
    /// A freshly submitted run in `Queued` state.
    pub fn queued(
        owner_id: impl Into<String>,
        definition: WorkflowDefinition,
        initial_input: serde_json::Value,
    ) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            owner_id: owner_id.into(),
            definition,
            initial_input,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
        }
    }
}

/// A requested status change for a run, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTransition {
    pub to: RunStatus,
    pub error_message: Option<String>,
    pub output: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl RunTransition {
    pub fn to(status: RunStatus) -> Self {
        Self {
            to: status,
            error_message: None,
            output: None,
            at: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Per-stage execution record. One per stage per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub run_id: Uuid,
    pub stage_id: String,
    pub status: StageStatus,
    /// Input after template resolution.
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Provider invocations made (0 for a cache hit).
    #[serde(default)]
    pub attempts: u32,
    /// Output was served from the result cache.
    #[serde(default)]
    pub cached: bool,
}

impl StageExecution {
    /// A stage that just became eligible.
    pub fn queued(run_id: Uuid, stage_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            run_id,
            stage_id: stage_id.into(),
            status: StageStatus::Queued,
            input,
            output: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            error_message: None,
            attempts: 0,
            cached: false,
        }
    }
}

/// Stage counts for a run, computed from its stage executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Stages in the definition.
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Stages currently dispatched to a provider.
    pub current_stage_ids: Vec<String>,
}

/// Run status plus progress, as returned by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub progress: RunProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_transitions_are_monotonic() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::InProgress));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::InProgress));

        assert!(!RunStatus::InProgress.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::InProgress));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, json!(status.as_str()));
        }
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn stage_definition_defaults_from_json() {
        let stage: StageDefinition = serde_json::from_value(json!({
            "id": "s1",
            "capability": "sum"
        }))
        .unwrap();
        assert_eq!(stage.input, json!({}));
        assert!(stage.dependencies.is_empty());
        assert!(stage.timeout_ms.is_none());
        assert!(stage.resource.is_none());
    }

    #[test]
    fn resource_claim_defaults_to_fail_strategy() {
        let claim: ResourceClaim = serde_json::from_value(json!({
            "resource_type": "document",
            "resource_id": "doc-1"
        }))
        .unwrap();
        assert_eq!(claim.strategy, ConflictStrategy::Fail);
    }

    #[test]
    fn queued_run_has_fresh_v7_id() {
        let def = WorkflowDefinition {
            name: "digest".to_string(),
            description: None,
            terminal_stage: None,
            stages: vec![StageDefinition::new("s1", "sum")],
        };
        let a = WorkflowRun::queued("alice", def.clone(), json!({}));
        let b = WorkflowRun::queued("alice", def, json!({}));
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.status, RunStatus::Queued);
        assert!(a.started_at.is_none());
    }
}
