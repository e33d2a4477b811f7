//! Shared domain types for Orchestra.
//!
//! Workflow definitions and runs, resource locks, budgets, cache entries,
//! audit records, lifecycle events, configuration, and the repository error
//! type shared by every storage port.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod audit;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod workflow;
