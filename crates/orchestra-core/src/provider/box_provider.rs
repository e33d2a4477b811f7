//! BoxCapabilityProvider -- object-safe dynamic dispatch wrapper for
//! CapabilityProvider.
//!
//! 1. `CapabilityProviderDyn` is an object-safe mirror with boxed futures
//! 2. Blanket-impl `CapabilityProviderDyn` for all `T: CapabilityProvider`
//! 3. `BoxCapabilityProvider` wraps `Arc<dyn CapabilityProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{CapabilityProvider, ProviderError, ProviderOutput};

/// Object-safe version of [`CapabilityProvider`] with boxed futures.
pub trait CapabilityProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        capability: &'a str,
        input: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderOutput, ProviderError>> + Send + 'a>>;
}

impl<T: CapabilityProvider> CapabilityProviderDyn for T {
    fn name(&self) -> &str {
        CapabilityProvider::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        capability: &'a str,
        input: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderOutput, ProviderError>> + Send + 'a>> {
        Box::pin(self.invoke(capability, input))
    }
}

/// Type-erased capability provider.
///
/// Cheap to clone so a stage task can own its provider handle.
#[derive(Clone)]
pub struct BoxCapabilityProvider {
    inner: Arc<dyn CapabilityProviderDyn>,
}

impl BoxCapabilityProvider {
    pub fn new<T: CapabilityProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Arc::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(
        &self,
        capability: &str,
        input: &Value,
    ) -> Result<ProviderOutput, ProviderError> {
        self.inner.invoke_boxed(capability, input).await
    }
}

impl std::fmt::Debug for BoxCapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapabilityProvider")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl CapabilityProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            capability: &str,
            input: &Value,
        ) -> Result<ProviderOutput, ProviderError> {
            if capability == "broken" {
                return Err(ProviderError::permanent("broken capability"));
            }
            Ok(ProviderOutput::new(json!({"capability": capability, "echo": input})).with_cost(3))
        }
    }

    #[tokio::test]
    async fn delegates_to_inner_provider() {
        let provider = BoxCapabilityProvider::new(Echo);
        assert_eq!(provider.name(), "echo");

        let out = provider.invoke("sum", &json!({"a": 1})).await.unwrap();
        assert_eq!(out.output, json!({"capability": "sum", "echo": {"a": 1}}));
        assert_eq!(out.cost_cents, Some(3));

        let err = provider.invoke("broken", &json!(null)).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "broken capability");
    }
}
