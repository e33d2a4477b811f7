//! Tamper-evident audit trail.
//!
//! Every stage attempt appends one [`AuditRecord`]. Records of a run form a
//! hash chain: each stores its predecessor's `record_hash` as `prev_hash`,
//! and its own hash covers that link plus the canonical signing payload.
//! With a [`PayloadSigner`] configured the payload is also signed, so
//! [`AuditTrail::verify`] can check both authorship and completeness.

use std::sync::Arc;

use dashmap::DashMap;
use orchestra_types::audit::{AuditEntry, AuditRecord, AuditSignature, VerificationReport};
use orchestra_types::error::RepositoryError;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{canonical_json, sha256_hex};
use crate::repository::audit::AuditStore;

// ---------------------------------------------------------------------------
// Errors and signing seams
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("no signature verifier configured")]
    NoVerifier,

    #[error("audit store error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signing failed: {0}")]
pub struct SigningError(pub String);

/// Produces detached signatures over canonical payload bytes.
pub trait PayloadSigner: Send + Sync {
    /// e.g. `"ed25519"`.
    fn algorithm(&self) -> &str;

    /// Identifier recorded as `AuditSignature::signer`.
    fn signer_id(&self) -> &str;

    /// Returns the encoded signature value.
    fn sign(&self, payload: &[u8]) -> Result<String, SigningError>;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &AuditSignature) -> bool;
}

// ---------------------------------------------------------------------------
// Payload and chain hashing
// ---------------------------------------------------------------------------

/// The canonical object a record's signature covers.
pub fn signing_payload(record: &AuditRecord) -> Value {
    json!({
        "runId": record.run_id.to_string(),
        "stageId": record.stage_id,
        "agentId": record.agent_id,
        "action": record.action.as_str(),
        "inputHash": record.input_hash,
        "outputHash": record.output_hash,
        "status": record.status,
        "timestamp": record.logged_at.to_rfc3339(),
    })
}

/// `sha256(prev_hash || canonical(payload + attempt))`.
pub fn compute_record_hash(record: &AuditRecord) -> String {
    let mut payload = signing_payload(record);
    if let Value::Object(map) = &mut payload {
        map.insert("attempt".to_string(), Value::from(record.attempt));
    }
    let mut material = record.prev_hash.clone().unwrap_or_default();
    material.push_str(&canonical_json(&payload));
    sha256_hex(material.as_bytes())
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

pub struct AuditTrail<A: AuditStore> {
    store: A,
    signer: Option<Arc<dyn PayloadSigner>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    /// Serializes appends per run so `prev_hash` always names the true predecessor.
    chains: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl<A: AuditStore> AuditTrail<A> {
    pub fn new(store: A) -> Self {
        Self {
            store,
            signer: None,
            verifier: None,
            chains: DashMap::new(),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn PayloadSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Append one record for `entry`.
    pub async fn log(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let chain = self.chains.entry(entry.run_id).or_default().clone();
        let _guard = chain.lock().await;

        let prev = self.store.last_for_run(&entry.run_id).await?;
        let mut logged_at = chrono::Utc::now();
        if let Some(prev) = &prev {
            logged_at = logged_at.max(prev.logged_at);
        }

        let mut record = AuditRecord {
            id: Uuid::now_v7(),
            run_id: entry.run_id,
            stage_id: entry.stage_id,
            agent_id: entry.agent_id,
            action: entry.action,
            input_hash: entry.input_hash,
            output_hash: entry.output_hash,
            status: entry.status,
            attempt: entry.attempt,
            signature: None,
            prev_hash: prev.map(|p| p.record_hash),
            record_hash: String::new(),
            logged_at,
        };

        if let Some(signer) = &self.signer {
            let payload = canonical_json(&signing_payload(&record));
            match signer.sign(payload.as_bytes()) {
                Ok(value) => {
                    record.signature = Some(AuditSignature {
                        algorithm: signer.algorithm().to_string(),
                        value,
                        signer: signer.signer_id().to_string(),
                        timestamp: logged_at,
                    });
                }
                Err(e) => tracing::warn!(
                    run_id = %record.run_id,
                    stage_id = record.stage_id.as_str(),
                    error = %e,
                    "audit signing failed; storing unsigned record"
                ),
            }
        }
        record.record_hash = compute_record_hash(&record);

        self.store.append(&record).await?;
        tracing::debug!(
            run_id = %record.run_id,
            stage_id = record.stage_id.as_str(),
            action = %record.action,
            attempt = record.attempt,
            "audit record appended"
        );
        Ok(record)
    }

    /// Records of a run in log order.
    pub async fn trail(&self, run_id: &Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.store.list_for_run(run_id).await?)
    }

    /// Check every signature and recompute the hash chain.
    pub async fn verify(&self, run_id: &Uuid) -> Result<VerificationReport, AuditError> {
        let verifier = self.verifier.as_ref().ok_or(AuditError::NoVerifier)?;
        let records = self.trail(run_id).await?;

        let mut report = VerificationReport {
            run_id: *run_id,
            total: records.len(),
            valid: 0,
            invalid: 0,
            unsigned: 0,
            chain_intact: chain_intact(&records),
            fully_verified: false,
        };

        for record in &records {
            match &record.signature {
                None => report.unsigned += 1,
                Some(signature) => {
                    let payload = canonical_json(&signing_payload(record));
                    if verifier.verify(payload.as_bytes(), signature) {
                        report.valid += 1;
                    } else {
                        report.invalid += 1;
                    }
                }
            }
        }

        report.fully_verified = report.invalid == 0 && report.unsigned == 0 && report.chain_intact;
        if !report.fully_verified {
            tracing::warn!(
                run_id = %run_id,
                invalid = report.invalid,
                unsigned = report.unsigned,
                chain_intact = report.chain_intact,
                "audit trail failed verification"
            );
        }
        Ok(report)
    }

    /// Drop the per-run append lock once a run will log no more records.
    pub fn close_run(&self, run_id: &Uuid) {
        self.chains.remove(run_id);
    }
}

/// Every record links to its predecessor and hashes to its stored value.
pub fn chain_intact(records: &[AuditRecord]) -> bool {
    let mut expected_prev: Option<&str> = None;
    for record in records {
        if record.prev_hash.as_deref() != expected_prev {
            return false;
        }
        if compute_record_hash(record) != record.record_hash {
            return false;
        }
        expected_prev = Some(record.record_hash.as_str());
    }
    true
}
