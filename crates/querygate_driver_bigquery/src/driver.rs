use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDate};
use gcp_bigquery_client::Client;
use gcp_bigquery_client::model::{
    dataset_reference::DatasetReference, get_query_results_parameters::GetQueryResultsParameters,
    job::Job, job_configuration::JobConfiguration,
    job_configuration_query::JobConfigurationQuery, table_row::TableRow,
};
use querygate_core::{Driver, GatewayError, Row, RowStream, StreamFrame, Value};
use serde::Deserialize;

pub const BACKEND_KIND: &str = "bigquery";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PAGE_SIZE: i32 = 500;

/// Registry factory: validates the connector blob without touching the
/// network.
pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Driver>, GatewayError> {
    let config: BigQueryConfig = serde_json::from_value(config.clone())
        .map_err(|e| GatewayError::invalid_config(format!("bigquery config: {e}")))?;
    config.validate()?;
    Ok(Box::new(BigQueryDriver::new(config)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset: String,
    /// Inline service-account key JSON.
    #[serde(default)]
    pub credentials_json: Option<serde_json::Value>,
    /// Path to a service-account key file. Alternative to
    /// `credentials_json`.
    #[serde(default)]
    pub key_file_path: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub max_billing_tier: Option<i32>,
}

impl BigQueryConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.project_id.trim().is_empty() {
            return Err(GatewayError::invalid_config(
                "bigquery: project_id is required",
            ));
        }
        if self.dataset.trim().is_empty() {
            return Err(GatewayError::invalid_config("bigquery: dataset is required"));
        }
        if self.credentials_json.is_none() && self.key_file_path.is_none() {
            return Err(GatewayError::invalid_config(
                "bigquery: credentials_json or key_file_path is required",
            ));
        }
        Ok(())
    }
}

/// Job-based warehouse driver: submit a query job, poll it to completion,
/// then page through the results.
pub struct BigQueryDriver {
    config: BigQueryConfig,
    client: Option<Client>,
}

impl BigQueryDriver {
    pub fn new(config: BigQueryConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }
}

#[async_trait]
impl Driver for BigQueryDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let start = Instant::now();

        let client = if let Some(key) = &self.config.credentials_json {
            let key = serde_json::from_value(key.clone()).map_err(|e| {
                GatewayError::connect_failed(format!("bigquery credentials_json: {e}"))
            })?;
            Client::from_service_account_key(key, false)
                .await
                .map_err(|e| GatewayError::connect_failed(format!("bigquery auth: {e}")))?
        } else if let Some(path) = &self.config.key_file_path {
            Client::from_service_account_key_file(path)
                .await
                .map_err(|e| GatewayError::connect_failed(format!("bigquery auth: {e}")))?
        } else {
            return Err(GatewayError::connect_failed(
                "bigquery: no credentials configured",
            ));
        };

        log::info!(
            "[BIGQUERY] Session ready for project {} in {:.2}ms",
            self.config.project_id,
            start.elapsed().as_secs_f64() * 1000.0
        );

        self.client = Some(client);
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>, GatewayError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| GatewayError::query_failed("bigquery driver not connected"))?;

        let job = Job {
            configuration: Some(JobConfiguration {
                query: Some(JobConfigurationQuery {
                    query: sql.to_string(),
                    use_legacy_sql: Some(false),
                    default_dataset: Some(DatasetReference {
                        project_id: self.config.project_id.clone(),
                        dataset_id: self.config.dataset.clone(),
                    }),
                    maximum_billing_tier: self.config.max_billing_tier,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let inserted = client
            .job()
            .insert(&self.config.project_id, job)
            .await
            .map_err(|e| GatewayError::query_failed(format!("bigquery job insert: {e}")))?;

        let job_id = inserted
            .job_reference
            .as_ref()
            .and_then(|r| r.job_id.clone())
            .ok_or_else(|| GatewayError::query_failed("bigquery job insert returned no job id"))?;

        log::debug!("[BIGQUERY] Submitted job {}", job_id);

        // Poll the job to a terminal state. The interval is short so a
        // dropped future (cancellation) takes effect quickly.
        loop {
            let job = client
                .job()
                .get_job(
                    &self.config.project_id,
                    &job_id,
                    self.config.location.as_deref(),
                )
                .await
                .map_err(|e| GatewayError::query_failed(format!("bigquery job poll: {e}")))?;

            let status = job.status.as_ref();
            let state = status.and_then(|s| s.state.as_ref());

            let state_name = state.map(|s| format!("{s:?}")).unwrap_or_default();
            if state_name.trim_matches('"').eq_ignore_ascii_case("done") {
                if let Some(error) = status.and_then(|s| s.error_result.as_ref()) {
                    let message = error
                        .message
                        .clone()
                        .unwrap_or_else(|| "bigquery job failed".to_string());
                    return Err(GatewayError::query_failed(message));
                }
                break;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(Box::new(BigQueryRowStream {
            client: client.clone(),
            project_id: self.config.project_id.clone(),
            location: self.config.location.clone(),
            job_id,
            header_sent: false,
            field_types: Vec::new(),
            buffered: VecDeque::new(),
            page_token: None,
            exhausted: false,
        }))
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            log::debug!(
                "[BIGQUERY] Released session for project {}",
                self.config.project_id
            );
        }
    }
}

struct BigQueryRowStream {
    client: Client,
    project_id: String,
    location: Option<String>,
    job_id: String,
    header_sent: bool,
    field_types: Vec<String>,
    buffered: VecDeque<Row>,
    page_token: Option<String>,
    exhausted: bool,
}

impl BigQueryRowStream {
    async fn fetch_page(&mut self) -> Result<Vec<String>, GatewayError> {
        let parameters = GetQueryResultsParameters {
            location: self.location.clone(),
            max_results: Some(PAGE_SIZE),
            page_token: self.page_token.take(),
            ..Default::default()
        };

        let response = self
            .client
            .job()
            .get_query_results(&self.project_id, &self.job_id, parameters)
            .await
            .map_err(|e| GatewayError::stream_failed(format!("bigquery results: {e}")))?;

        let mut columns = Vec::new();
        if self.field_types.is_empty()
            && let Some(schema) = &response.schema
            && let Some(fields) = &schema.fields
        {
            for field in fields {
                columns.push(field.name.clone());
                self.field_types.push(format!("{:?}", field.r#type));
            }
        }

        for row in response.rows.unwrap_or_default() {
            self.buffered.push_back(self.coerce_row(&row));
        }

        self.page_token = response.page_token;
        if self.page_token.is_none() {
            self.exhausted = true;
        }

        Ok(columns)
    }

    fn coerce_row(&self, row: &TableRow) -> Row {
        let cells = row.columns.as_deref().unwrap_or(&[]);
        (0..self.field_types.len())
            .map(|i| {
                let raw = cells.get(i).and_then(|c| c.value.as_ref());
                coerce_cell(raw, &self.field_types[i])
            })
            .collect()
    }
}

#[async_trait]
impl RowStream for BigQueryRowStream {
    async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
        if !self.header_sent {
            let columns = self.fetch_page().await?;
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(columns)));
        }

        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(StreamFrame::Row(row)));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn close(&mut self) {
        // Result pages are plain REST reads; nothing is held server-side.
        self.buffered.clear();
        self.exhausted = true;
    }
}

/// Coerce a REST result cell into a portable value.
///
/// BigQuery's REST surface returns every scalar as a JSON string; the
/// schema field type decides the decode. Text fallback when a cell does
/// not parse as its declared type.
fn coerce_cell(raw: Option<&serde_json::Value>, field_type: &str) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }

    let text = match raw {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match field_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or(Value::Text(text)),
        "FLOAT" | "FLOAT64" => text
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(text)),
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Text(text),
        },
        "NUMERIC" | "BIGNUMERIC" => Value::Decimal(text),
        "TIMESTAMP" => text
            .parse::<f64>()
            .ok()
            .and_then(|epoch| {
                DateTime::from_timestamp(
                    epoch.trunc() as i64,
                    (epoch.fract() * 1e9).round() as u32,
                )
            })
            .map(Value::Timestamp)
            .unwrap_or(Value::Text(text)),
        "DATE" => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or(Value::Text(text)),
        "BYTES" => base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map(Value::Bytes)
            .unwrap_or(Value::Text(text)),
        _ => Value::Text(text),
    }
}
