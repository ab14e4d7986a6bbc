use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use native_tls::{Certificate, Identity, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use querygate_core::{Driver, GatewayError, RowStream, StreamFrame, Value};
use serde::Deserialize;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Statement};
use uuid::Uuid;

pub const BACKEND_KIND: &str = "postgres";

/// Registry factory: validates the connector blob without touching the
/// network.
pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Driver>, GatewayError> {
    let config: PostgresConfig = serde_json::from_value(config.clone())
        .map_err(|e| GatewayError::invalid_config(format!("postgres config: {e}")))?;
    config.validate()?;
    Ok(Box::new(PostgresDriver::new(config)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// PEM-encoded client certificate path.
    #[serde(default)]
    pub ssl_cert: Option<String>,
    /// PEM-encoded client key path.
    #[serde(default)]
    pub ssl_key: Option<String>,
    /// PEM-encoded root certificate path.
    #[serde(default)]
    pub ssl_root_cert: Option<String>,
    #[serde(default)]
    pub search_path: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
    /// Session pool sizing, accepted for compatibility with stored
    /// connector blobs. The gateway opens one session per task.
    #[serde(default)]
    pub max_open_conns: Option<u32>,
    #[serde(default)]
    pub max_idle_conns: Option<u32>,
    #[serde(default)]
    pub conn_max_lifetime: Option<u64>,
}

impl PostgresConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::invalid_config("postgres: host is required"));
        }
        if self.database.trim().is_empty() {
            return Err(GatewayError::invalid_config(
                "postgres: database is required",
            ));
        }
        if self.username.trim().is_empty() {
            return Err(GatewayError::invalid_config(
                "postgres: username is required",
            ));
        }
        if self.ssl_cert.is_some() != self.ssl_key.is_some() {
            return Err(GatewayError::invalid_config(
                "postgres: ssl_cert and ssl_key must be provided together",
            ));
        }
        Ok(())
    }
}

pub struct PostgresDriver {
    config: PostgresConfig,
    client: Option<Client>,
    connection_task: Option<tokio::task::JoinHandle<()>>,
    /// Statement cache keyed by SQL text. Preparing also yields column
    /// metadata up front, so empty result sets still produce a header.
    statements: HashMap<String, Statement>,
}

impl PostgresDriver {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            client: None,
            connection_task: None,
            statements: HashMap::new(),
        }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.username)
            .password(&self.config.password)
            .connect_timeout(Duration::from_secs(30));

        if let Some(name) = &self.config.application_name {
            pg.application_name(name);
        }
        if let Some(search_path) = &self.config.search_path {
            pg.options(&format!("-c search_path={search_path}"));
        }
        pg
    }

    fn tls_connector(&self) -> Result<MakeTlsConnector, GatewayError> {
        let mut builder = TlsConnector::builder();

        match self.config.ssl_mode {
            SslMode::Disable => unreachable!("caller checks ssl_mode"),
            SslMode::Require => {
                builder.danger_accept_invalid_certs(true);
            }
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyFull => {}
        }

        if let Some(path) = &self.config.ssl_root_cert {
            let pem = std::fs::read(path).map_err(|e| {
                GatewayError::connect_failed(format!("read ssl_root_cert {path}: {e}"))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| GatewayError::connect_failed(format!("parse ssl_root_cert: {e}")))?;
            builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&self.config.ssl_cert, &self.config.ssl_key) {
            let cert = std::fs::read(cert_path).map_err(|e| {
                GatewayError::connect_failed(format!("read ssl_cert {cert_path}: {e}"))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                GatewayError::connect_failed(format!("read ssl_key {key_path}: {e}"))
            })?;
            let identity = Identity::from_pkcs8(&cert, &key)
                .map_err(|e| GatewayError::connect_failed(format!("parse client identity: {e}")))?;
            builder.identity(identity);
        }

        let connector = builder
            .build()
            .map_err(|e| GatewayError::connect_failed(format!("TLS setup failed: {e}")))?;
        Ok(MakeTlsConnector::new(connector))
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let start = Instant::now();
        let pg = self.pg_config();

        let (client, task) = if self.config.ssl_mode == SslMode::Disable {
            let (client, connection) = pg
                .connect(NoTls)
                .await
                .map_err(|e| connect_error(&e, &self.config))?;
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    log::warn!("[POSTGRES] Connection task ended with error: {}", e);
                }
            });
            (client, task)
        } else {
            let tls = self.tls_connector()?;
            let (client, connection) = pg
                .connect(tls)
                .await
                .map_err(|e| connect_error(&e, &self.config))?;
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    log::warn!("[POSTGRES] Connection task ended with error: {}", e);
                }
            });
            (client, task)
        };

        client
            .batch_execute("SELECT 1")
            .await
            .map_err(|e| connect_error(&e, &self.config))?;

        log::info!(
            "[POSTGRES] Connected to {}:{}/{} in {:.2}ms",
            self.config.host,
            self.config.port,
            self.config.database,
            start.elapsed().as_secs_f64() * 1000.0
        );

        self.client = Some(client);
        self.connection_task = Some(task);
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>, GatewayError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| GatewayError::query_failed("postgres driver not connected"))?;

        let statement = match self.statements.get(sql) {
            Some(statement) => statement.clone(),
            None => {
                let statement = client.prepare(sql).await.map_err(query_error)?;
                self.statements.insert(sql.to_string(), statement.clone());
                statement
            }
        };

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let type_names: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.type_().name().to_string())
            .collect();

        let rows = client
            .query_raw(&statement, Vec::<i32>::new())
            .await
            .map_err(query_error)?;

        log::debug!(
            "[POSTGRES] Streaming query started ({} columns)",
            columns.len()
        );

        Ok(Box::new(PostgresRowStream {
            header: Some(columns),
            type_names,
            rows: Some(Box::pin(rows)),
        }))
    }

    async fn close(&mut self) {
        self.statements.clear();
        if self.client.take().is_some() {
            log::debug!("[POSTGRES] Closing session to {}", self.config.host);
        }
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
    }
}

struct PostgresRowStream {
    header: Option<Vec<String>>,
    type_names: Vec<String>,
    rows: Option<Pin<Box<tokio_postgres::RowStream>>>,
}

#[async_trait]
impl RowStream for PostgresRowStream {
    async fn next(&mut self) -> Result<Option<StreamFrame>, GatewayError> {
        if let Some(columns) = self.header.take() {
            return Ok(Some(StreamFrame::Header(columns)));
        }

        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };

        match rows.try_next().await {
            Ok(Some(row)) => {
                let values = (0..self.type_names.len())
                    .map(|i| postgres_value(&row, i, &self.type_names[i]))
                    .collect();
                Ok(Some(StreamFrame::Row(values)))
            }
            Ok(None) => {
                self.rows = None;
                Ok(None)
            }
            Err(e) => {
                self.rows = None;
                Err(query_error(e))
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the portal stream releases the server-side cursor.
        self.rows = None;
        self.header = None;
    }
}

fn postgres_value(row: &tokio_postgres::Row, idx: usize, type_name: &str) -> Value {
    match type_name {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Decimal(d.to_string()))
            .unwrap_or(Value::Null),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|naive| Value::Timestamp(DateTime::from_naive_utc_and_offset(naive, Utc)))
            .unwrap_or(Value::Null),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        "uuid" => row
            .try_get::<_, Option<Uuid>>(idx)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

/// SQLSTATEs worth retrying at a higher layer. Classification only; the
/// driver never retries.
fn retryable_sqlstate(code: &SqlState) -> bool {
    [
        SqlState::T_R_SERIALIZATION_FAILURE,
        SqlState::T_R_DEADLOCK_DETECTED,
        SqlState::LOCK_NOT_AVAILABLE,
        SqlState::ADMIN_SHUTDOWN,
        SqlState::CRASH_SHUTDOWN,
        SqlState::CANNOT_CONNECT_NOW,
    ]
    .contains(code)
}

fn query_error(e: tokio_postgres::Error) -> GatewayError {
    match e.as_db_error() {
        Some(db) => {
            let retryable = retryable_sqlstate(db.code());
            if retryable {
                log::warn!(
                    "[POSTGRES] Retryable backend error ({}): {}",
                    db.code().code(),
                    db.message()
                );
                GatewayError::query_failed_retryable(db.message())
            } else {
                GatewayError::query_failed(db.message())
            }
        }
        None => GatewayError::query_failed(e.to_string()),
    }
}

fn connect_error(e: &tokio_postgres::Error, config: &PostgresConfig) -> GatewayError {
    let source = e.to_string();
    let message = if source.contains("timed out") {
        format!(
            "Connection to {}:{} timed out",
            config.host, config.port
        )
    } else if source.contains("Connection refused") {
        format!(
            "Connection refused at {}:{}",
            config.host, config.port
        )
    } else if source.contains("password authentication failed") {
        "Authentication failed".to_string()
    } else {
        format!("Connection error: {source}")
    };
    log::error!("[POSTGRES] Connect failed: {}", message);
    GatewayError::connect_failed(message)
}
