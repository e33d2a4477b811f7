//! Infrastructure layer for Orchestra.
//!
//! Contains implementations of the ports defined in `orchestra-core`:
//! SQLite storage for runs, locks, budgets and audit records, Ed25519
//! audit signing, the HTTP capability provider, and the config loader.

pub mod config;
pub mod crypto;
pub mod provider;
pub mod sqlite;
