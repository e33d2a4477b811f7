//! Capability providers.
//!
//! A capability provider is whatever actually performs a stage's work (an
//! agent, a model endpoint, a local function). The engine only sees the
//! [`CapabilityProvider`] trait and applies timeouts and retries itself.

pub mod box_provider;
pub mod registry;

use serde_json::Value;
use thiserror::Error;

/// Successful provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub output: Value,
    /// Actual cost when the provider reports one; the stage estimate is
    /// recorded otherwise.
    pub cost_cents: Option<u64>,
}

impl ProviderOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            cost_cents: None,
        }
    }

    pub fn with_cost(mut self, cost_cents: u64) -> Self {
        self.cost_cents = Some(cost_cents);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    /// The engine re-attempts only retryable failures.
    pub retryable: bool,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Performs the work behind one or more capability names.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Wrap in [`box_provider::BoxCapabilityProvider`] for dynamic dispatch.
pub trait CapabilityProvider: Send + Sync {
    /// Human-readable provider name, used in logs and as the audit agent id.
    fn name(&self) -> &str;

    fn invoke(
        &self,
        capability: &str,
        input: &Value,
    ) -> impl std::future::Future<Output = Result<ProviderOutput, ProviderError>> + Send;
}
