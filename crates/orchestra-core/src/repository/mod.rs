//! Storage ports.
//!
//! These traits define the storage interface the coordination services and
//! the execution engine depend on. `orchestra-infra` implements the
//! relational ones with SQLite; [`memory`] holds process-local
//! implementations backed by `DashMap`, used for the key-value cache store
//! and for single-process deployments and tests.
//!
//! Every method is one atomic operation against the underlying store. No
//! port exposes a multi-call transaction.

pub mod audit;
pub mod budget;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod run;

/// The concrete store types one deployment wires together.
///
/// Lets the engine and service name a single type parameter instead of one
/// per port.
pub trait Stores: Send + Sync + 'static {
    type Runs: run::RunRepository + 'static;
    type Locks: lock::LockStore + 'static;
    type Budgets: budget::BudgetStore + 'static;
    type Audit: audit::AuditStore + 'static;
    type Kv: kv::KvStore + 'static;
}
