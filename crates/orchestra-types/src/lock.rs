//! Resource lock types.
//!
//! A `ResourceLock` is an optimistic, TTL-bounded claim on a named resource.
//! At most one `Active` lock exists per `(resource_type, resource_id)`; an
//! `Active` lock whose `expires_at` has passed is treated as absent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to do when a resource is already locked by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The contending stage fails.
    #[default]
    Fail,
    /// Wait for the holder to release, bounded by the stage timeout.
    Queue,
    /// Surface the conflict for an external merge.
    Merge,
    /// Surface the conflict for human escalation.
    Escalate,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Queue => "queue",
            Self::Merge => "merge",
            Self::Escalate => "escalate",
        }
    }

    /// Whether a conflict under this strategy is advisory rather than fatal.
    pub fn is_advisory(self) -> bool {
        matches!(self, Self::Merge | Self::Escalate)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "queue" => Ok(Self::Queue),
            "merge" => Ok(Self::Merge),
            "escalate" => Ok(Self::Escalate),
            other => Err(format!("invalid conflict strategy: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Released,
    Expired,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(format!("invalid lock status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub lock_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub owner_id: String,
    /// One greater than the previous lock on the same resource.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub conflict_strategy: ConflictStrategy,
    pub status: LockStatus,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    /// Active and not yet past `expires_at`.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Active && self.expires_at > now
    }

    /// The status a reader should observe at `now` (lazy expiry).
    pub fn effective_status(&self, now: DateTime<Utc>) -> LockStatus {
        if self.status == LockStatus::Active && self.expires_at <= now {
            LockStatus::Expired
        } else {
            self.status
        }
    }
}

/// Describes a contended acquisition: who holds the resource and how the
/// requester asked conflicts to be handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    pub resource_type: String,
    pub resource_id: String,
    pub strategy: ConflictStrategy,
    pub requested_by: String,
    pub held_by: String,
    pub holder_lock_id: Uuid,
    pub holder_expires_at: DateTime<Utc>,
}

/// Result of comparing a lock's stored content hash to a caller-supplied one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentConflictCheck {
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_hash: Option<String>,
    pub current_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lock(expires_in: Duration) -> ResourceLock {
        let now = Utc::now();
        ResourceLock {
            lock_id: Uuid::now_v7(),
            resource_type: "document".to_string(),
            resource_id: "doc-1".to_string(),
            owner_id: "run:stage".to_string(),
            version: 1,
            content_hash: None,
            conflict_strategy: ConflictStrategy::Fail,
            status: LockStatus::Active,
            acquired_at: now,
            expires_at: now + expires_in,
        }
    }

    #[test]
    fn expired_active_lock_reads_as_expired() {
        let l = lock(Duration::seconds(-1));
        assert!(!l.is_held_at(Utc::now()));
        assert_eq!(l.effective_status(Utc::now()), LockStatus::Expired);
    }

    #[test]
    fn live_lock_is_held() {
        let l = lock(Duration::seconds(30));
        assert!(l.is_held_at(Utc::now()));
        assert_eq!(l.effective_status(Utc::now()), LockStatus::Active);
    }

    #[test]
    fn strategy_parses_and_classifies() {
        assert_eq!("queue".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Queue);
        assert!(ConflictStrategy::Merge.is_advisory());
        assert!(ConflictStrategy::Escalate.is_advisory());
        assert!(!ConflictStrategy::Fail.is_advisory());
        assert!("block".parse::<ConflictStrategy>().is_err());
    }
}
