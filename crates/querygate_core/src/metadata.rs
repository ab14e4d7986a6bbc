use crate::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stored query definition: template text bound to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub id: String,
    pub connector_id: String,
    /// Template text with named placeholders.
    pub content: String,
}

/// Stored connector configuration.
///
/// `config` is opaque here; it is interpreted only by the driver factory
/// registered for `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub config: serde_json::Value,
}

/// Read-only point lookups against the persistent metadata store.
///
/// Both lookups return zero or one record. Implementations may be remote
/// (PostgREST) or in-memory (tests); the resolver treats them identically.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn query_definition(&self, id: &str) -> Result<Option<QueryDefinition>, GatewayError>;

    async fn connector_config(&self, id: &str) -> Result<Option<ConnectorConfig>, GatewayError>;
}
