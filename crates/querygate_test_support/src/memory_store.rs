use async_trait::async_trait;
use querygate_core::{ConnectorConfig, GatewayError, MetadataStore, QueryDefinition};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory metadata store for tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    queries: Arc<RwLock<HashMap<String, QueryDefinition>>>,
    connectors: Arc<RwLock<HashMap<String, ConnectorConfig>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(
        self,
        id: impl Into<String>,
        connector_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let id = id.into();
        self.queries.write().unwrap().insert(
            id.clone(),
            QueryDefinition {
                id,
                connector_id: connector_id.into(),
                content: content.into(),
            },
        );
        self
    }

    pub fn with_connector(
        self,
        id: impl Into<String>,
        kind: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        let id = id.into();
        self.connectors.write().unwrap().insert(
            id.clone(),
            ConnectorConfig {
                id,
                kind: kind.into(),
                config,
            },
        );
        self
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn query_definition(&self, id: &str) -> Result<Option<QueryDefinition>, GatewayError> {
        Ok(self.queries.read().unwrap().get(id).cloned())
    }

    async fn connector_config(&self, id: &str) -> Result<Option<ConnectorConfig>, GatewayError> {
        Ok(self.connectors.read().unwrap().get(id).cloned())
    }
}
