//! Lifecycle events published by the execution engine.
//!
//! `WorkflowEvent` is broadcast on the event bus wrapped in an
//! `EventEnvelope` carrying a process-wide sequence number, so a delivery
//! component can replay from the last sequence a subscriber saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::{BudgetAction, BudgetScope};
use crate::lock::LockConflict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        total_stages: usize,
    },

    LevelStarted {
        run_id: Uuid,
        level: usize,
        stage_ids: Vec<String>,
    },

    StageStarted {
        run_id: Uuid,
        stage_id: String,
        capability: String,
        attempt: u32,
    },

    StageCompleted {
        run_id: Uuid,
        stage_id: String,
        duration_ms: u64,
        cached: bool,
    },

    StageFailed {
        run_id: Uuid,
        stage_id: String,
        error: String,
        will_retry: bool,
    },

    /// A stage hit a held lock under an advisory strategy.
    LockConflict {
        run_id: Uuid,
        stage_id: String,
        conflict: LockConflict,
    },

    /// A check denied spend; `action` says how the engine reacted.
    BudgetExceeded {
        run_id: Uuid,
        stage_id: String,
        scope: BudgetScope,
        scope_id: String,
        usage_percent: f64,
        action: BudgetAction,
    },

    /// Spend first crossed the alert threshold in the current period.
    BudgetThresholdReached {
        scope: BudgetScope,
        scope_id: String,
        current_spend_cents: u64,
        max_cost_cents: u64,
    },

    RunPaused {
        run_id: Uuid,
        reason: String,
    },

    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        stages_completed: usize,
    },

    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },

    RunCancelled {
        run_id: Uuid,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::LevelStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::LockConflict { run_id, .. }
            | Self::BudgetExceeded { run_id, .. }
            | Self::RunPaused { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id } => Some(*run_id),
            Self::BudgetThresholdReached { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = WorkflowEvent::RunCancelled { run_id: Uuid::nil() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "run_cancelled");
        assert_eq!(event.run_id(), Some(Uuid::nil()));
    }

    #[test]
    fn threshold_event_has_no_run() {
        let event = WorkflowEvent::BudgetThresholdReached {
            scope: BudgetScope::Agent,
            scope_id: "summarizer".to_string(),
            current_spend_cents: 800,
            max_cost_cents: 1000,
        };
        assert!(event.run_id().is_none());
    }
}
