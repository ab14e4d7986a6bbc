use thiserror::Error;

/// Gateway operation errors.
///
/// All resolver, driver, and admission operations return this error type so
/// the protocol layer can surface a uniform `{error, code}` frame regardless
/// of which backend produced the failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No query definition stored under the requested id.
    #[error("Query not found: {0}")]
    QueryNotFound(String),

    /// The query definition references a connector that does not exist.
    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    /// No driver factory registered for the connector's backend type.
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Query template failed to parse.
    #[error("Template parse error: {0}")]
    TemplateParse(String),

    /// Query template parsed but failed to render with the supplied data.
    #[error("Template render error: {0}")]
    TemplateRender(String),

    /// A stream with this id is already active on the connection.
    #[error("Duplicate stream id: {0}")]
    DuplicateStream(String),

    /// The connection's task queue is at capacity.
    #[error("Query queue is full")]
    QueueFull,

    /// Inbound frame missing required fields.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Cancel targeted a stream that is not active.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Failed to establish a backend session.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Backend rejected or aborted the query.
    #[error("{message}")]
    QueryFailed { message: String, retryable: bool },

    /// Streaming results failed mid-flight.
    #[error("Stream failed: {0}")]
    StreamFailed(String),

    /// The task's context was cancelled.
    #[error("Query cancelled")]
    Cancelled,

    /// Connector config blob is malformed or missing required fields.
    #[error("Invalid connector config: {0}")]
    InvalidConfig(String),

    /// Metadata store lookup failed (network, auth, malformed response).
    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    pub fn query_failed(msg: impl Into<String>) -> Self {
        Self::QueryFailed {
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn query_failed_retryable(msg: impl Into<String>) -> Self {
        Self::QueryFailed {
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn stream_failed(msg: impl Into<String>) -> Self {
        Self::StreamFailed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Stable wire code for the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueryNotFound(_) => "QueryNotFound",
            Self::ConnectorNotFound(_) => "ConnectorNotFound",
            Self::UnsupportedBackend(_) => "UnsupportedBackend",
            Self::TemplateParse(_) => "TemplateParseError",
            Self::TemplateRender(_) => "TemplateRenderError",
            Self::DuplicateStream(_) => "DuplicateStream",
            Self::QueueFull => "QueueFull",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::StreamNotFound(_) => "StreamNotFound",
            Self::ConnectFailed(_) => "ConnectError",
            Self::QueryFailed { .. } => "QueryError",
            Self::StreamFailed(_) => "StreamError",
            Self::Cancelled => "Cancelled",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Metadata(_) => "MetadataError",
            Self::Io(_) => "IoError",
        }
    }

    /// Whether a higher layer could retry the operation. Informational;
    /// the gateway itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueryFailed { retryable: true, .. })
    }
}
