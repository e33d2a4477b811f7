//! Workflow engine: definition parsing, leveling, and execution.
//!
//! - `definition` -- YAML parsing and validation
//! - `graph` -- dependency graph checks and level computation
//! - `template` -- `${path}` / `{{ path }}` input templates
//! - `context` -- per-run store of workflow input and stage outputs
//! - `retry` -- retry policy and backoff
//! - `executor` -- level-by-level parallel execution engine
//! - `service` -- submit / status / result / cancel / resume

pub mod context;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod retry;
pub mod service;
pub mod template;
