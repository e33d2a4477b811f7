//! Audit trail types.
//!
//! Records are append-only. Each carries the hash of its predecessor in the
//! same run (`prev_hash`) and its own `record_hash`, so removing or editing
//! any record breaks the chain.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// First attempt at a stage (or a cache hit).
    Execute,
    /// A re-attempt after a retryable failure.
    Retry,
    /// The final failed attempt.
    Fail,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" => Ok(Self::Execute),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(format!("invalid audit action: '{other}'")),
        }
    }
}

/// Detached signature over a record's canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSignature {
    /// e.g. `"ed25519"`.
    pub algorithm: String,
    /// Base64-encoded signature bytes.
    pub value: String,
    /// Identifier of the signing key.
    pub signer: String,
    pub timestamp: DateTime<Utc>,
}

/// What the caller supplies to `AuditTrail::log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub stage_id: String,
    pub agent_id: String,
    pub action: AuditAction,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub status: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage_id: String,
    pub agent_id: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    pub status: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<AuditSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
    pub logged_at: DateTime<Utc>,
}

/// Outcome of verifying a run's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub unsigned: usize,
    /// Every record's hash and back-link recompute correctly.
    pub chain_intact: bool,
    pub fully_verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_names() {
        assert_eq!(AuditAction::Execute.to_string(), "execute");
        assert_eq!("retry".parse::<AuditAction>().unwrap(), AuditAction::Retry);
        assert_eq!(
            serde_json::to_value(AuditAction::Fail).unwrap(),
            serde_json::json!("fail")
        );
        assert!("skip".parse::<AuditAction>().is_err());
    }
}
