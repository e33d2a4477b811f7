//! Process-local store implementations backed by `DashMap`.
//!
//! Each atomic port operation holds the shard guard of the entry it touches
//! for its whole read-modify-write. Where two maps are involved the guard
//! order is always the per-key map first, then the by-id map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use orchestra_types::audit::AuditRecord;
use orchestra_types::budget::{Budget, BudgetScope};
use orchestra_types::error::RepositoryError;
use orchestra_types::lock::{LockStatus, ResourceLock};
use orchestra_types::workflow::{RunStatus, RunTransition, StageExecution, WorkflowRun};
use uuid::Uuid;

use super::audit::AuditStore;
use super::budget::BudgetStore;
use super::kv::KvStore;
use super::lock::{LockInsert, LockStore};
use super::run::RunRepository;
use super::Stores;

/// All-in-memory store set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStores;

impl Stores for MemoryStores {
    type Runs = MemoryRunRepository;
    type Locks = MemoryLockStore;
    type Budgets = MemoryBudgetStore;
    type Audit = MemoryAuditStore;
    type Kv = MemoryKvStore;
}

// ---------------------------------------------------------------------------
// Key-value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KvItem {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl KvItem {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// TTL-aware key-value store. Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    items: DashMap<String, KvItem>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let now = Instant::now();
        if let Some(item) = self.items.get(key) {
            if item.is_live(now) {
                return Ok(Some(item.value.clone()));
            }
        }
        self.items.remove_if(key, |_, item| !item.is_live(now));
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        self.items.insert(
            key.to_string(),
            KvItem {
                value: value.clone(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, RepositoryError> {
        let now = Instant::now();
        let fresh = || KvItem {
            value: serde_json::Value::from(1),
            expires_at: ttl.map(|t| now + t),
        };
        match self.items.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let item = occupied.get_mut();
                if !item.is_live(now) {
                    *item = fresh();
                    return Ok(1);
                }
                let current = item.value.as_i64().ok_or_else(|| {
                    RepositoryError::Query(format!("value at '{key}' is not an integer"))
                })?;
                item.value = serde_json::Value::from(current + 1);
                Ok(current + 1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RepositoryError> {
        let now = Instant::now();
        Ok(self
            .items
            .remove(key)
            .is_some_and(|(_, item)| item.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .items
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRunRepository {
    runs: DashMap<Uuid, WorkflowRun>,
    stages: DashMap<Uuid, Vec<StageExecution>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        match self.runs.entry(run.run_id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.run_id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> Result<WorkflowRun, RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if !run.status.can_transition_to(transition.to) {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} cannot move from {} to {}",
                run.status, transition.to
            )));
        }
        run.status = transition.to;
        if transition.to == RunStatus::InProgress && run.started_at.is_none() {
            run.started_at = Some(transition.at);
        }
        if transition.to.is_terminal() {
            run.completed_at = Some(transition.at);
        }
        if let Some(message) = &transition.error_message {
            run.error_message = Some(message.clone());
        }
        if let Some(output) = &transition.output {
            run.output = Some(output.clone());
        }
        Ok(run.clone())
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self.runs.iter().map(|r| r.clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn save_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let mut stages = self.stages.entry(stage.run_id).or_default();
        match stages.iter_mut().find(|s| s.stage_id == stage.stage_id) {
            Some(existing) => *existing = stage.clone(),
            None => stages.push(stage.clone()),
        }
        Ok(())
    }

    async fn list_stages(&self, run_id: &Uuid) -> Result<Vec<StageExecution>, RepositoryError> {
        Ok(self
            .stages
            .get(run_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockSlot {
    active: Option<Uuid>,
    version: u64,
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    slots: DashMap<(String, String), LockSlot>,
    locks: DashMap<Uuid, ResourceLock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        mut lock: ResourceLock,
        now: DateTime<Utc>,
    ) -> Result<LockInsert, RepositoryError> {
        let key = (lock.resource_type.clone(), lock.resource_id.clone());
        let mut slot = self.slots.entry(key).or_default();

        if let Some(active_id) = slot.active {
            if let Some(mut current) = self.locks.get_mut(&active_id) {
                if current.is_held_at(now) {
                    return Ok(LockInsert::Held(current.clone()));
                }
                if current.status == LockStatus::Active {
                    current.status = LockStatus::Expired;
                }
            }
        }

        slot.version += 1;
        lock.version = slot.version;
        lock.status = LockStatus::Active;
        slot.active = Some(lock.lock_id);
        self.locks.insert(lock.lock_id, lock.clone());
        Ok(LockInsert::Acquired(lock))
    }

    async fn get(&self, lock_id: &Uuid) -> Result<Option<ResourceLock>, RepositoryError> {
        Ok(self.locks.get(lock_id).map(|l| l.clone()))
    }

    async fn find_active(
        &self,
        resource_type: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceLock>, RepositoryError> {
        let key = (resource_type.to_string(), resource_id.to_string());
        let Some(active_id) = self.slots.get(&key).and_then(|s| s.active) else {
            return Ok(None);
        };
        Ok(self
            .locks
            .get(&active_id)
            .filter(|l| l.is_held_at(now))
            .map(|l| l.clone()))
    }

    async fn set_status(
        &self,
        lock_id: &Uuid,
        from: LockStatus,
        to: LockStatus,
    ) -> Result<bool, RepositoryError> {
        let key = match self.locks.get(lock_id) {
            Some(l) => (l.resource_type.clone(), l.resource_id.clone()),
            None => return Ok(false),
        };
        let mut slot = self.slots.entry(key).or_default();
        let Some(mut lock) = self.locks.get_mut(lock_id) else {
            return Ok(false);
        };
        if lock.status != from {
            return Ok(false);
        }
        lock.status = to;
        if to != LockStatus::Active && slot.active == Some(*lock_id) {
            slot.active = None;
        }
        Ok(true)
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let stale: Vec<Uuid> = self
            .locks
            .iter()
            .filter(|l| l.status == LockStatus::Active && l.expires_at <= now)
            .map(|l| l.lock_id)
            .collect();
        let mut expired = 0;
        for lock_id in stale {
            if self
                .set_status(&lock_id, LockStatus::Active, LockStatus::Expired)
                .await?
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<ResourceLock>, RepositoryError> {
        let mut locks: Vec<ResourceLock> = self
            .locks
            .iter()
            .filter(|l| l.is_held_at(now))
            .map(|l| l.clone())
            .collect();
        locks.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        Ok(locks)
    }
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBudgetStore {
    budgets: DashMap<(BudgetScope, String), Budget>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: BudgetScope, scope_id: &str) -> (BudgetScope, String) {
        (scope, scope_id.to_string())
    }
}

impl BudgetStore for MemoryBudgetStore {
    async fn create(&self, budget: &Budget) -> Result<(), RepositoryError> {
        match self.budgets.entry(Self::key(budget.scope, &budget.scope_id)) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "budget already exists for {}:{}",
                budget.scope, budget.scope_id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(budget.clone());
                Ok(())
            }
        }
    }

    async fn get(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> Result<Option<Budget>, RepositoryError> {
        Ok(self
            .budgets
            .get(&Self::key(scope, scope_id))
            .map(|b| b.clone()))
    }

    async fn list(&self) -> Result<Vec<Budget>, RepositoryError> {
        let mut budgets: Vec<Budget> = self.budgets.iter().map(|b| b.clone()).collect();
        budgets.sort_by(|a, b| (a.scope.as_str(), &a.scope_id).cmp(&(b.scope.as_str(), &b.scope_id)));
        Ok(budgets)
    }

    async fn delete(&self, scope: BudgetScope, scope_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.budgets.remove(&Self::key(scope, scope_id)).is_some())
    }

    async fn reset_period(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        expected_start: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut budget = self
            .budgets
            .get_mut(&Self::key(scope, scope_id))
            .ok_or(RepositoryError::NotFound)?;
        if budget.period_start_at != expected_start {
            return Ok(false);
        }
        budget.current_spend_cents = 0;
        budget.alert_sent = false;
        budget.period_start_at = new_start;
        Ok(true)
    }

    async fn add_spend(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        cost_cents: u64,
    ) -> Result<Budget, RepositoryError> {
        let mut budget = self
            .budgets
            .get_mut(&Self::key(scope, scope_id))
            .ok_or(RepositoryError::NotFound)?;
        budget.current_spend_cents = budget.current_spend_cents.saturating_add(cost_cents);
        Ok(budget.clone())
    }

    async fn mark_alert_sent(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> Result<bool, RepositoryError> {
        let mut budget = self
            .budgets
            .get_mut(&Self::key(scope, scope_id))
            .ok_or(RepositoryError::NotFound)?;
        if budget.alert_sent {
            return Ok(false);
        }
        budget.alert_sent = true;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: DashMap<Uuid, Vec<(u64, AuditRecord)>>,
    seq: AtomicU64,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), RepositoryError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.records
            .entry(record.run_id)
            .or_default()
            .push((seq, record.clone()));
        Ok(())
    }

    async fn list_for_run(&self, run_id: &Uuid) -> Result<Vec<AuditRecord>, RepositoryError> {
        let Some(records) = self.records.get(run_id) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<&(u64, AuditRecord)> = records.iter().collect();
        ordered.sort_by(|a, b| a.1.logged_at.cmp(&b.1.logged_at).then(a.0.cmp(&b.0)));
        Ok(ordered.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn last_for_run(&self, run_id: &Uuid) -> Result<Option<AuditRecord>, RepositoryError> {
        Ok(self
            .records
            .get(run_id)
            .and_then(|records| records.iter().max_by_key(|(seq, _)| *seq).map(|(_, r)| r.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::budget::{BudgetAction, BudgetPeriod};
    use orchestra_types::lock::ConflictStrategy;
    use orchestra_types::workflow::{StageDefinition, WorkflowDefinition};
    use serde_json::json;

    fn lock(owner: &str, ttl_ms: i64) -> ResourceLock {
        let now = Utc::now();
        ResourceLock {
            lock_id: Uuid::now_v7(),
            resource_type: "document".to_string(),
            resource_id: "doc-1".to_string(),
            owner_id: owner.to_string(),
            version: 0,
            content_hash: None,
            conflict_strategy: ConflictStrategy::Fail,
            status: LockStatus::Active,
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms),
        }
    }

    #[tokio::test]
    async fn kv_ttl_and_incr() {
        let kv = MemoryKvStore::new();
        kv.set_with_ttl("a", &json!({"x": 1}), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(kv.incr("a:hits", None).await.unwrap(), 1);
        assert_eq!(kv.incr("a:hits", None).await.unwrap(), 2);
        assert_eq!(kv.scan_prefix("a").await.unwrap(), vec!["a", "a:hits"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.scan_prefix("a").await.unwrap(), vec!["a:hits"]);
        assert!(kv.delete("a:hits").await.unwrap());
        assert!(!kv.delete("a:hits").await.unwrap());
    }

    #[tokio::test]
    async fn kv_incr_rejects_non_integer() {
        let kv = MemoryKvStore::new();
        kv.set_with_ttl("k", &json!("text"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            kv.incr("k", None).await.unwrap_err(),
            RepositoryError::Query(_)
        ));
    }

    #[tokio::test]
    async fn run_transitions_are_compare_and_set() {
        let repo = MemoryRunRepository::new();
        let def = WorkflowDefinition {
            name: "w".to_string(),
            description: None,
            terminal_stage: None,
            stages: vec![StageDefinition::new("s1", "noop")],
        };
        let run = WorkflowRun::queued("alice", def, json!({}));
        repo.create_run(&run).await.unwrap();
        assert!(matches!(
            repo.create_run(&run).await.unwrap_err(),
            RepositoryError::Conflict(_)
        ));

        let started = repo
            .transition_run(&run.run_id, &RunTransition::to(RunStatus::InProgress))
            .await
            .unwrap();
        assert!(started.started_at.is_some());

        let done = repo
            .transition_run(
                &run.run_id,
                &RunTransition::to(RunStatus::Completed).with_output(json!(1)),
            )
            .await
            .unwrap();
        assert_eq!(done.output, Some(json!(1)));
        assert!(done.completed_at.is_some());

        let err = repo
            .transition_run(&run.run_id, &RunTransition::to(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let missing = repo
            .transition_run(&Uuid::now_v7(), &RunTransition::to(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn stage_save_is_upsert() {
        let repo = MemoryRunRepository::new();
        let run_id = Uuid::now_v7();
        let mut stage = StageExecution::queued(run_id, "s1", json!({}));
        repo.save_stage(&stage).await.unwrap();
        repo.save_stage(&StageExecution::queued(run_id, "s2", json!({})))
            .await
            .unwrap();
        stage.attempts = 2;
        repo.save_stage(&stage).await.unwrap();

        let stages = repo.list_stages(&run_id).await.unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_id, "s1");
        assert_eq!(stages[0].attempts, 2);
    }

    #[tokio::test]
    async fn lock_versions_increase_and_expired_holder_is_replaced() {
        let store = MemoryLockStore::new();
        let first = match store.try_acquire(lock("a", 20), Utc::now()).await.unwrap() {
            LockInsert::Acquired(l) => l,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert_eq!(first.version, 1);

        let held = store.try_acquire(lock("b", 1000), Utc::now()).await.unwrap();
        assert!(matches!(held, LockInsert::Held(l) if l.owner_id == "a"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = match store.try_acquire(lock("b", 1000), Utc::now()).await.unwrap() {
            LockInsert::Acquired(l) => l,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert_eq!(second.version, 2);
        assert_eq!(
            store.get(&first.lock_id).await.unwrap().unwrap().status,
            LockStatus::Expired
        );
    }

    #[tokio::test]
    async fn release_clears_slot() {
        let store = MemoryLockStore::new();
        let LockInsert::Acquired(l) = store.try_acquire(lock("a", 10_000), Utc::now()).await.unwrap()
        else {
            panic!("expected acquisition");
        };
        assert!(store
            .set_status(&l.lock_id, LockStatus::Active, LockStatus::Released)
            .await
            .unwrap());
        assert!(!store
            .set_status(&l.lock_id, LockStatus::Active, LockStatus::Released)
            .await
            .unwrap());
        assert!(store
            .find_active("document", "doc-1", Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store.list_active(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_stale_counts() {
        let store = MemoryLockStore::new();
        store.try_acquire(lock("a", 1), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.expire_stale(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.expire_stale(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn budget_reset_is_compare_and_set() {
        let store = MemoryBudgetStore::new();
        let budget = Budget::new(
            BudgetScope::Workflow,
            "digest",
            1000,
            BudgetAction::Kill,
            BudgetPeriod::Daily,
        );
        store.create(&budget).await.unwrap();
        assert!(store.create(&budget).await.is_err());

        let after = store
            .add_spend(BudgetScope::Workflow, "digest", 400)
            .await
            .unwrap();
        assert_eq!(after.current_spend_cents, 400);
        assert!(store.mark_alert_sent(BudgetScope::Workflow, "digest").await.unwrap());
        assert!(!store.mark_alert_sent(BudgetScope::Workflow, "digest").await.unwrap());

        let new_start = budget.period_start_at + chrono::Duration::days(1);
        assert!(store
            .reset_period(BudgetScope::Workflow, "digest", budget.period_start_at, new_start)
            .await
            .unwrap());
        assert!(!store
            .reset_period(BudgetScope::Workflow, "digest", budget.period_start_at, new_start)
            .await
            .unwrap());

        let reset = store.get(BudgetScope::Workflow, "digest").await.unwrap().unwrap();
        assert_eq!(reset.current_spend_cents, 0);
        assert!(!reset.alert_sent);
        assert_eq!(reset.period_start_at, new_start);
    }
}
