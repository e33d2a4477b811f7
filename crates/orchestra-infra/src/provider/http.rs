//! HTTP capability provider.
//!
//! POSTs `{"capability": .., "input": ..}` as JSON to a configured endpoint
//! and expects `{"output": .., "cost_cents": ..}` back (`cost_cents` is
//! optional). Server errors, rate limiting, timeouts and connection
//! failures are transient; other non-success statuses and malformed bodies
//! are permanent.

use std::time::Duration;

use orchestra_core::provider::box_provider::BoxCapabilityProvider;
use orchestra_core::provider::registry::ProviderRegistry;
use orchestra_core::provider::{CapabilityProvider, ProviderError, ProviderOutput};
use orchestra_types::config::{HttpProviderConfig, OrchestraConfig};
use serde_json::{Value, json};

pub struct HttpCapabilityProvider {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpCapabilityProvider {
    pub fn new(name: impl Into<String>, config: &HttpProviderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("orchestra/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name: name.into(),
            url: config.url.clone(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify_send_error(url: &str, e: reqwest::Error) -> ProviderError {
    let message = format!("request to '{url}' failed: {e}");
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn parse_response(body: Value) -> Result<ProviderOutput, ProviderError> {
    let Value::Object(mut fields) = body else {
        return Err(ProviderError::permanent("provider response is not a JSON object"));
    };
    let output = fields
        .remove("output")
        .ok_or_else(|| ProviderError::permanent("provider response has no 'output' field"))?;

    let response = ProviderOutput::new(output);
    match fields.get("cost_cents") {
        None | Some(Value::Null) => Ok(response),
        Some(cost) => cost
            .as_u64()
            .map(|c| response.with_cost(c))
            .ok_or_else(|| ProviderError::permanent(format!("invalid cost_cents: {cost}"))),
    }
}

impl CapabilityProvider for HttpCapabilityProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, capability: &str, input: &Value) -> Result<ProviderOutput, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "capability": capability, "input": input }))
            .send()
            .await
            .map_err(|e| classify_send_error(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status} from '{}': {body}", self.url);
            tracing::debug!(provider = %self.name, capability, status = status.as_u16(), "provider returned error status");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ProviderError::transient(message)
            } else {
                ProviderError::permanent(message)
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("failed to parse provider response: {e}")))?;
        parse_response(body)
    }
}

/// One HTTP provider per `[providers.<capability>]` table.
pub fn build_registry(config: &OrchestraConfig) -> Result<ProviderRegistry, reqwest::Error> {
    let mut registry = ProviderRegistry::new();
    for (capability, endpoint) in &config.providers {
        let provider = HttpCapabilityProvider::new(format!("http:{capability}"), endpoint)?;
        tracing::debug!(capability = %capability, url = %endpoint.url, "registered HTTP provider");
        registry.register(capability.clone(), BoxCapabilityProvider::new(provider));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn echo(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({
            "output": { "capability": body["capability"], "echo": body["input"] },
            "cost_cents": 7,
        }))
    }

    async fn unavailable() -> (StatusCode, &'static str) {
        (StatusCode::SERVICE_UNAVAILABLE, "busy")
    }

    async fn rejected() -> (StatusCode, &'static str) {
        (StatusCode::UNPROCESSABLE_ENTITY, "bad input")
    }

    async fn slow() -> Json<Value> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Json(json!({ "output": null }))
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/echo", post(echo))
            .route("/unavailable", post(unavailable))
            .route("/rejected", post(rejected))
            .route("/slow", post(slow));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(url: String, timeout_ms: u64) -> HttpCapabilityProvider {
        HttpCapabilityProvider::new("test", &HttpProviderConfig { url, timeout_ms }).unwrap()
    }

    #[tokio::test]
    async fn posts_capability_and_input() {
        let base = serve().await;
        let out = provider(format!("{base}/echo"), 5_000)
            .invoke("summarize", &json!({"doc": "hi"}))
            .await
            .unwrap();
        assert_eq!(out.output, json!({"capability": "summarize", "echo": {"doc": "hi"}}));
        assert_eq!(out.cost_cents, Some(7));
    }

    #[tokio::test]
    async fn classifies_failures() {
        let base = serve().await;

        let err = provider(format!("{base}/unavailable"), 5_000)
            .invoke("x", &json!({}))
            .await
            .unwrap_err();
        assert!(err.retryable);

        let err = provider(format!("{base}/rejected"), 5_000)
            .invoke("x", &json!({}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("422"));

        let err = provider(format!("{base}/slow"), 50)
            .invoke("x", &json!({}))
            .await
            .unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = provider(format!("http://{addr}/gone"), 1_000)
            .invoke("x", &json!({}))
            .await
            .unwrap_err();
        assert!(err.retryable);
    }

    #[test]
    fn response_shape_is_checked() {
        assert_eq!(
            parse_response(json!({"output": 1})).unwrap(),
            ProviderOutput::new(json!(1))
        );
        assert!(!parse_response(json!([1])).unwrap_err().retryable);
        assert!(!parse_response(json!({"result": 1})).unwrap_err().retryable);
        assert!(parse_response(json!({"output": 1, "cost_cents": -3})).is_err());
    }

    #[test]
    fn registry_has_one_provider_per_capability() {
        let mut config = OrchestraConfig::default();
        for name in ["translate", "summarize"] {
            config.providers.insert(
                name.to_string(),
                HttpProviderConfig {
                    url: format!("http://localhost:9000/{name}"),
                    timeout_ms: 1_000,
                },
            );
        }
        let registry = build_registry(&config).unwrap();
        assert_eq!(registry.capabilities(), vec!["summarize", "translate"]);
        assert_eq!(registry.get("summarize").unwrap().name(), "http:summarize");
    }
}
