//! Bridge context
//!
//! Bundles the supervisor and the resource registry into the one object
//! collaborators receive. Whoever constructs it drives `start`/`shutdown`.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::config::ServerConfig;
use crate::registry::{ResourceId, ResourceRegistry};
use crate::retry::{retry, RetryPolicy};
use crate::supervisor::Supervisor;
use crate::{Error, Result};

pub struct BridgeContext {
    /// Analysis server process manager
    pub supervisor: Supervisor,

    /// Documents announced to the server
    pub registry: Arc<ResourceRegistry<Supervisor>>,

    retry_policy: RetryPolicy,
}

impl BridgeContext {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let capacity = config.max_open_resources;
        let supervisor = Supervisor::new(config);
        let registry = Arc::new(ResourceRegistry::new(supervisor.clone(), capacity));

        Ok(Self {
            supervisor,
            registry,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Start the analysis server
    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await?;
        tracing::info!("Analysis server started");
        Ok(())
    }

    /// Close all documents, then stop the analysis server
    pub async fn shutdown(&self) -> Result<()> {
        if self.supervisor.is_ready() {
            self.registry.close_all().await;
        }
        self.supervisor.shutdown().await
    }

    /// Restart the analysis server
    pub async fn restart(&self) -> Result<()> {
        self.shutdown().await?;
        self.start().await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    /// Announce a document to the server if it is not already open
    pub async fn ensure_open(&self, path: impl AsRef<Path>) -> Result<ResourceId> {
        self.registry.ensure_open(path).await
    }

    /// Request with the default timeout, retrying transient failures
    pub async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        retry(&self.retry_policy, || {
            self.supervisor.request(method, params.clone())
        })
        .await
    }

    pub async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        self.supervisor.notify(method, params).await
    }

    /// Request scoped to a document: opens it first and fills in `textDocument`
    pub async fn document_request(
        &self,
        path: impl AsRef<Path>,
        method: &str,
        params: JsonValue,
    ) -> Result<JsonValue> {
        let mut params = match params {
            JsonValue::Null => json!({}),
            JsonValue::Object(map) => JsonValue::Object(map),
            other => {
                return Err(Error::InvalidParams(format!(
                    "document request params must be an object, got {}",
                    other
                )))
            }
        };
        let id = self.ensure_open(path).await?;
        params["textDocument"] = json!({ "uri": id.as_str() });

        self.request(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_config() {
        let config = ServerConfig {
            max_open_resources: 0,
            ..ServerConfig::default()
        };
        assert!(BridgeContext::new(config).is_err());
    }

    #[tokio::test]
    async fn test_requests_fail_fast_when_not_started() {
        let context = BridgeContext::new(ServerConfig::default())
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            });
        assert!(!context.is_ready());
        assert!(matches!(
            context.request("workspace/symbol", json!({"query": ""})).await,
            Err(Error::NotRunning)
        ));
        context.shutdown().await.unwrap();
    }
}
