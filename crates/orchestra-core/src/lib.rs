//! Coordination core for Orchestra.
//!
//! Holds the execution engine and the shared services it drives (lock
//! manager, budget enforcer, result cache, audit trail) together with the
//! storage ports they are written against. Depends only on
//! `orchestra-types`; `orchestra-infra` supplies the durable stores.

pub mod audit;
pub mod budget;
pub mod cache;
pub mod canonical;
pub mod error;
pub mod event;
pub mod lock;
pub mod provider;
pub mod repository;
pub mod workflow;
