//! Orchestration error taxonomy.
//!
//! Each subsystem keeps its own error enum. `OrchestrationError` is the
//! caller-facing classification the workflow service returns, and the
//! rendering used for stage failure messages.

use orchestra_types::budget::BudgetScope;
use orchestra_types::error::RepositoryError;
use orchestra_types::lock::LockConflict;
use orchestra_types::workflow::RunStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditError;
use crate::budget::BudgetError;
use crate::lock::LockError;
use crate::workflow::definition::DefinitionError;
use crate::workflow::executor::ExecutorError;
use crate::workflow::graph::GraphError;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Malformed definition, rejected before a run exists.
    #[error("invalid workflow: {0}")]
    WorkflowInvalid(String),

    #[error("stage '{stage_id}' failed: {message}")]
    StageFailed { stage_id: String, message: String },

    #[error("resource {resource_type}/{resource_id} is locked by '{held_by}'")]
    LockConflict {
        resource_type: String,
        resource_id: String,
        held_by: String,
    },

    #[error("budget exceeded for {scope}:{scope_id} ({usage_percent:.1}% of limit)")]
    BudgetExceeded {
        scope: BudgetScope,
        scope_id: String,
        usage_percent: f64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// `result` on a run that has not completed.
    #[error("run {run_id} is not ready ({status})")]
    NotReady { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} is {status}")]
    InvalidState { run_id: Uuid, status: RunStatus },

    #[error("run {0} was cancelled")]
    Cancelled(Uuid),

    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),
}

impl From<DefinitionError> for OrchestrationError {
    fn from(e: DefinitionError) -> Self {
        match e {
            DefinitionError::Graph(g) => Self::from(g),
            DefinitionError::Invalid(msg) | DefinitionError::Parse(msg) => Self::WorkflowInvalid(msg),
            DefinitionError::Io(io) => Self::WorkflowInvalid(io.to_string()),
        }
    }
}

impl From<GraphError> for OrchestrationError {
    fn from(e: GraphError) -> Self {
        Self::WorkflowInvalid(e.to_string())
    }
}

impl From<LockConflict> for OrchestrationError {
    fn from(c: LockConflict) -> Self {
        Self::LockConflict {
            resource_type: c.resource_type,
            resource_id: c.resource_id,
            held_by: c.held_by,
        }
    }
}

impl From<LockError> for OrchestrationError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::NotFound(id) => Self::NotFound(format!("lock {id}")),
            e @ LockError::Forbidden { .. } => Self::Forbidden(e.to_string()),
            LockError::WaitTimedOut {
                resource_type,
                resource_id,
                held_by,
                ..
            } => Self::LockConflict {
                resource_type,
                resource_id,
                held_by,
            },
            e @ LockError::InvalidTtl => Self::Repository(RepositoryError::Query(e.to_string())),
            LockError::Repository(r) => Self::Repository(r),
        }
    }
}

impl From<BudgetError> for OrchestrationError {
    fn from(e: BudgetError) -> Self {
        match e {
            e @ BudgetError::AlreadyExists { .. } => {
                Self::Repository(RepositoryError::Conflict(e.to_string()))
            }
            BudgetError::Invalid(msg) => Self::Repository(RepositoryError::Query(msg)),
            BudgetError::Repository(r) => Self::Repository(r),
        }
    }
}

impl From<AuditError> for OrchestrationError {
    fn from(e: AuditError) -> Self {
        match e {
            e @ AuditError::NoVerifier => Self::Repository(RepositoryError::Query(e.to_string())),
            AuditError::Repository(r) => Self::Repository(r),
        }
    }
}

impl From<ExecutorError> for OrchestrationError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::RunNotFound(id) => Self::NotFound(format!("run {id}")),
            ExecutorError::InvalidState { run_id, status } => Self::InvalidState { run_id, status },
            ExecutorError::Definition(g) => Self::from(g),
            ExecutorError::Repository(r) => Self::Repository(r),
            ExecutorError::Join(msg) => Self::Repository(RepositoryError::Query(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestra_types::lock::ConflictStrategy;

    #[test]
    fn lock_conflict_names_the_holder() {
        let conflict = LockConflict {
            resource_type: "document".into(),
            resource_id: "doc-1".into(),
            strategy: ConflictStrategy::Fail,
            requested_by: "run-b".into(),
            held_by: "run-a".into(),
            holder_lock_id: Uuid::nil(),
            holder_expires_at: Utc::now(),
        };
        let err = OrchestrationError::from(conflict);
        assert_eq!(err.to_string(), "resource document/doc-1 is locked by 'run-a'");
    }

    #[test]
    fn budget_exceeded_renders_usage() {
        let err = OrchestrationError::BudgetExceeded {
            scope: BudgetScope::Workflow,
            scope_id: "digest".into(),
            usage_percent: 105.0,
        };
        assert_eq!(err.to_string(), "budget exceeded for workflow:digest (105.0% of limit)");
    }

    #[test]
    fn lock_errors_map_to_management_classes() {
        let forbidden = LockError::Forbidden {
            lock_id: Uuid::nil(),
            holder: "a".into(),
            requester: "b".into(),
        };
        assert!(matches!(
            OrchestrationError::from(forbidden),
            OrchestrationError::Forbidden(_)
        ));
        assert!(matches!(
            OrchestrationError::from(LockError::NotFound(Uuid::nil())),
            OrchestrationError::NotFound(_)
        ));
    }

    #[test]
    fn graph_errors_become_workflow_invalid() {
        let err = OrchestrationError::from(GraphError::Empty);
        assert!(matches!(err, OrchestrationError::WorkflowInvalid(_)));
    }
}
