use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_athena::Client;
use aws_sdk_athena::config::Credentials;
use aws_sdk_athena::types::{
    QueryExecutionContext, QueryExecutionState, ResultConfiguration,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use querygate_core::{Driver, GatewayError, Row, RowStream, StreamFrame, Value};
use serde::Deserialize;

pub const BACKEND_KIND: &str = "athena";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PAGE_SIZE: i32 = 1000;

/// Registry factory: validates the connector blob without touching the
/// network.
pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Driver>, GatewayError> {
    let config: AthenaConfig = serde_json::from_value(config.clone())
        .map_err(|e| GatewayError::invalid_config(format!("athena config: {e}")))?;
    config.validate()?;
    Ok(Box::new(AthenaDriver::new(config)))
}

fn default_workgroup() -> String {
    "primary".to_string()
}

fn default_catalog() -> String {
    "AwsDataCatalog".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AthenaConfig {
    pub region: String,
    pub database: String,
    /// S3 location where Athena writes the result artifact.
    pub output_location: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_workgroup")]
    pub workgroup: String,
    #[serde(default = "default_catalog")]
    pub catalog: String,
}

impl AthenaConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.region.trim().is_empty() {
            return Err(GatewayError::invalid_config("athena: region is required"));
        }
        if self.database.trim().is_empty() {
            return Err(GatewayError::invalid_config("athena: database is required"));
        }
        if self.output_location.trim().is_empty() {
            return Err(GatewayError::invalid_config(
                "athena: output_location is required",
            ));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(GatewayError::invalid_config(
                "athena: access_key_id and secret_access_key must be provided together",
            ));
        }
        Ok(())
    }
}

/// Lakehouse driver: submit a query execution, poll it to a terminal
/// state, then paginate the result pages.
pub struct AthenaDriver {
    config: AthenaConfig,
    client: Option<Client>,
}

impl AthenaDriver {
    pub fn new(config: AthenaConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }
}

#[async_trait]
impl Driver for AthenaDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let start = Instant::now();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&self.config.access_key_id, &self.config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                self.config.session_token.clone(),
                None,
                "querygate-connector",
            ));
        }

        let sdk_config = loader.load().await;
        self.client = Some(Client::new(&sdk_config));

        log::info!(
            "[ATHENA] Session ready for {} ({}) in {:.2}ms",
            self.config.database,
            self.config.region,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>, GatewayError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| GatewayError::query_failed("athena driver not connected"))?;

        let started = client
            .start_query_execution()
            .query_string(sql)
            .work_group(&self.config.workgroup)
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database(&self.config.database)
                    .catalog(&self.config.catalog)
                    .build(),
            )
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(&self.config.output_location)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| GatewayError::query_failed(format!("athena submit: {e}")))?;

        let execution_id = started
            .query_execution_id()
            .ok_or_else(|| GatewayError::query_failed("athena returned no query execution id"))?
            .to_string();

        log::debug!("[ATHENA] Submitted query execution {}", execution_id);

        // Poll to a terminal state. Short interval so a dropped future
        // (cancellation) takes effect quickly.
        loop {
            let execution = client
                .get_query_execution()
                .query_execution_id(&execution_id)
                .send()
                .await
                .map_err(|e| GatewayError::query_failed(format!("athena poll: {e}")))?;

            let status = execution
                .query_execution()
                .and_then(|q| q.status());

            match status.and_then(|s| s.state()) {
                Some(QueryExecutionState::Succeeded) => break,
                Some(QueryExecutionState::Failed) | Some(QueryExecutionState::Cancelled) => {
                    let reason = status
                        .and_then(|s| s.state_change_reason())
                        .unwrap_or("athena query did not succeed");
                    return Err(GatewayError::query_failed(reason));
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        Ok(Box::new(AthenaRowStream {
            client: client.clone(),
            execution_id,
            header_sent: false,
            first_page: true,
            column_names: Vec::new(),
            column_types: Vec::new(),
            buffered: VecDeque::new(),
            next_token: None,
            exhausted: false,
        }))
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            log::debug!("[ATHENA] Released session for {}", self.config.database);
        }
    }
}

struct AthenaRowStream {
    client: Client,
    execution_id: String,
    header_sent: bool,
    first_page: bool,
    column_names: Vec<String>,
    column_types: Vec<String>,
    buffered: VecDeque<Row>,
    next_token: Option<String>,
    exhausted: bool,
}

impl AthenaRowStream {
    async fn fetch_page(&mut self) -> Result<(), GatewayError> {
        let response = self
            .client
            .get_query_results()
            .query_execution_id(&self.execution_id)
            .set_next_token(self.next_token.take())
            .max_results(PAGE_SIZE)
            .send()
            .await
            .map_err(|e| GatewayError::stream_failed(format!("athena results: {e}")))?;

        let result_set = response.result_set();

        if self.column_names.is_empty()
            && let Some(metadata) = result_set.and_then(|r| r.result_set_metadata())
        {
            for info in metadata.column_info() {
                self.column_names.push(info.name().to_string());
                self.column_types.push(info.r#type().to_string());
            }
        }

        let rows = result_set.map(|r| r.rows()).unwrap_or_default();
        for (i, row) in rows.iter().enumerate() {
            // Athena repeats the column labels as the first row of the
            // first page of a SELECT result.
            if self.first_page && i == 0 && row_is_header(row, &self.column_names) {
                continue;
            }
            self.buffered.push_back(self.coerce_row(row));
        }
        self.first_page = false;

        self.next_token = response.next_token().map(str::to_string);
        if self.next_token.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }

    fn coerce_row(&self, row: &aws_sdk_athena::types::Row) -> Row {
        let data = row.data();
        (0..self.column_names.len())
            .map(|i| {
                let raw = data.get(i).and_then(|d| d.var_char_value());
                coerce_datum(raw, self.column_types.get(i).map(String::as_str))
            })
            .collect()
    }
}

fn row_is_header(row: &aws_sdk_athena::types::Row, column_names: &[String]) -> bool {
    let data = row.data();
    data.len() == column_names.len()
        && data
            .iter()
            .zip(column_names)
            .all(|(datum, name)| datum.var_char_value() == Some(name.as_str()))
}

#[async_trait]
impl RowStream for AthenaRowStream {
    async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
        if !self.header_sent {
            self.fetch_page().await?;
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(self.column_names.clone())));
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
        // Results live in the S3 output artifact; nothing to release.
        self.buffered.clear();
        self.exhausted = true;
    }
}

/// Coerce one Athena datum (always a varchar on the wire) into a portable
/// value using the declared column type. Text fallback when the datum does
/// not parse as its declared type.
fn coerce_datum(raw: Option<&str>, column_type: Option<&str>) -> Value {
    let Some(text) = raw else {
        return Value::Null;
    };

    match column_type.unwrap_or("varchar") {
        "tinyint" | "smallint" | "integer" | "int" | "bigint" => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(text.to_string())),
        "real" | "float" | "double" => text
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(text.to_string())),
        "boolean" => match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Text(text.to_string()),
        },
        "decimal" => Value::Decimal(text.to_string()),
        "timestamp" => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| Value::Timestamp(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)))
            .unwrap_or_else(|_| Value::Text(text.to_string())),
        "date" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or_else(|_| Value::Text(text.to_string())),
        "varbinary" => {
            let compact: String = text.split_whitespace().collect();
            hex::decode(&compact)
                .map(Value::Bytes)
                .unwrap_or_else(|_| Value::Text(text.to_string()))
        }
        _ => Value::Text(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_defaults_workgroup_and_catalog() {
        let config: AthenaConfig = serde_json::from_value(serde_json::json!({
            "region": "us-east-1",
            "database": "lake",
            "output_location": "s3://results/"
        }))
        .unwrap();

        assert_eq!(config.workgroup, "primary");
        assert_eq!(config.catalog, "AwsDataCatalog");
        config.validate().unwrap();
    }

    #[test]
    fn factory_rejects_missing_output_location() {
        assert!(
            factory(&serde_json::json!({
                "region": "us-east-1", "database": "lake"
            }))
            .is_err()
        );
        assert!(
            factory(&serde_json::json!({
                "region": "us-east-1", "database": "lake",
                "output_location": "s3://results/", "access_key_id": "AKIA..."
            }))
            .is_err()
        );
    }

    #[test]
    fn datum_coercion_by_column_type() {
        assert_eq!(coerce_datum(Some("42"), Some("bigint")), Value::Int(42));
        assert_eq!(coerce_datum(Some("1.5"), Some("double")), Value::Float(1.5));
        assert_eq!(
            coerce_datum(Some("true"), Some("boolean")),
            Value::Bool(true)
        );
        assert_eq!(
            coerce_datum(Some("9.99"), Some("decimal")),
            Value::Decimal("9.99".into())
        );
        assert_eq!(coerce_datum(None, Some("bigint")), Value::Null);
        assert_eq!(
            coerce_datum(Some("de ad be ef"), Some("varbinary")),
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn timestamp_datum_parses_fractional_seconds() {
        match coerce_datum(Some("2024-03-01 12:00:00.250"), Some("timestamp")) {
            Value::Timestamp(ts) => {
                assert_eq!(ts.timestamp_subsec_millis(), 250);
            }
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn unknown_types_stay_text() {
        assert_eq!(
            coerce_datum(Some("{\"a\":1}"), Some("json")),
            Value::Text("{\"a\":1}".into())
        );
    }
}
