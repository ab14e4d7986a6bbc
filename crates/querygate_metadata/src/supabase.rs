use async_trait::async_trait;
use querygate_core::{ConnectorConfig, GatewayError, MetadataStore, QueryDefinition};
use serde::de::DeserializeOwned;
use std::time::Duration;

const QUERIES_TABLE: &str = "queries";
const CONNECTORS_TABLE: &str = "connectors";

/// Metadata store backed by a Supabase project's PostgREST endpoint.
///
/// Performs exactly two kinds of read-only point lookups; each returns
/// zero or one record. Responses carry whatever extra columns the tables
/// have; only the fields the gateway needs are deserialized.
pub struct SupabaseStore {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl SupabaseStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    async fn fetch_one<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, GatewayError> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let id_filter = format!("eq.{id}");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("select", "*"),
                ("id", id_filter.as_str()),
                ("limit", "1"),
            ])
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| GatewayError::Metadata(format!("{table} lookup failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Metadata(format!(
                "{table} lookup returned {status}: {body}"
            )));
        }

        let mut records: Vec<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Metadata(format!("{table} response malformed: {e}")))?;

        log::debug!(
            "[METADATA] {}({}) -> {} record(s)",
            table,
            id,
            records.len()
        );

        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }
}

#[async_trait]
impl MetadataStore for SupabaseStore {
    async fn query_definition(&self, id: &str) -> Result<Option<QueryDefinition>, GatewayError> {
        self.fetch_one(QUERIES_TABLE, id).await
    }

    async fn connector_config(&self, id: &str) -> Result<Option<ConnectorConfig>, GatewayError> {
        self.fetch_one(CONNECTORS_TABLE, id).await
    }
}
