//! Application state wiring all services together.
//!
//! `AppState` pins the generic workflow service to the SQLite stores, loads
//! audit keys from the configured paths, and registers the configured HTTP
//! capability providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use orchestra_core::audit::{AuditTrail, PayloadSigner, SignatureVerifier};
use orchestra_core::repository::memory::MemoryKvStore;
use orchestra_core::workflow::executor::{EngineServices, ExecutionEngine};
use orchestra_core::workflow::service::WorkflowService;
use orchestra_infra::config::load_config;
use orchestra_infra::crypto::{Ed25519Signer, Ed25519Verifier};
use orchestra_infra::provider::build_registry;
use orchestra_infra::sqlite::SqliteStores;
use orchestra_infra::sqlite::audit::SqliteAuditStore;
use orchestra_infra::sqlite::budget::SqliteBudgetStore;
use orchestra_infra::sqlite::lock::SqliteLockStore;
use orchestra_infra::sqlite::pool::DatabasePool;
use orchestra_infra::sqlite::run::SqliteRunRepository;
use orchestra_types::config::AuditConfig;

pub type ConcreteWorkflowService = WorkflowService<SqliteStores>;

/// Shared application state used by every command handler.
#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<ConcreteWorkflowService>,
}

impl AppState {
    /// Create the data directory, open the database, and wire the engine.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;

        let db_url = format!("sqlite://{}?mode=rwc", data_dir.join("orchestra.db").display());
        let pool = DatabasePool::new(&db_url)
            .await
            .context("failed to open the orchestra database")?;

        let audit = audit_trail(SqliteAuditStore::new(pool.clone()), &config.audit)?;
        let providers = build_registry(&config).context("failed to build HTTP providers")?;
        tracing::debug!(capabilities = ?providers.capabilities(), "capability providers ready");

        let services = EngineServices::<SqliteStores>::new(
            SqliteRunRepository::new(pool.clone()),
            SqliteLockStore::new(pool.clone()),
            SqliteBudgetStore::new(pool),
            audit,
            MemoryKvStore::new(),
            providers,
            &config,
        );
        let workflows = WorkflowService::new(ExecutionEngine::new(services));

        Ok(Self {
            workflows: Arc::new(workflows),
        })
    }
}

/// Attach the configured signer and verifier.
///
/// Without an explicit verify key, the signing key's public half verifies.
fn audit_trail(
    store: SqliteAuditStore,
    config: &AuditConfig,
) -> anyhow::Result<AuditTrail<SqliteAuditStore>> {
    let mut trail = AuditTrail::new(store);

    let signer = match &config.signing_key_path {
        Some(path) => Some(
            Ed25519Signer::from_file(path, config.signer_id.clone())
                .context("failed to load the audit signing key")?,
        ),
        None => None,
    };

    let verifier = match (&config.verify_key_path, &signer) {
        (Some(path), _) => {
            Some(Ed25519Verifier::from_file(path).context("failed to load the audit verify key")?)
        }
        (None, Some(signer)) => Some(Ed25519Verifier::new(signer.verifying_key())),
        (None, None) => None,
    };

    if let Some(signer) = signer {
        trail = trail.with_signer(Arc::new(signer) as Arc<dyn PayloadSigner>);
    }
    if let Some(verifier) = verifier {
        trail = trail.with_verifier(Arc::new(verifier) as Arc<dyn SignatureVerifier>);
    }
    Ok(trail)
}
