use querygate_core::{GatewayError, TaskStatus, Value};
use serde::{Deserialize, Serialize};

/// Default cap on a single inbound frame, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Frames a client may send. The schema is closed: any other `type` is a
/// protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Query {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "queryId")]
        query_id: String,
        #[serde(rename = "templateData", default = "empty_object")]
        template_data: serde_json::Value,
    },
    Cancel {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnsMeta {
    pub columns: Vec<String>,
    /// Row count hint at header time; usually 0 because the total is
    /// unknown before streaming. `complete.totalRows` is authoritative.
    #[serde(rename = "totalRows", skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub metadata: ColumnsMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPayload {
    pub data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(rename = "totalRows")]
    pub total_rows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Frames the server emits. Each frame is one JSON object on the wire and
/// the atomic unit of delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Status {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: StatusPayload,
    },
    Metadata {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: MetadataPayload,
    },
    Row {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: RowPayload,
    },
    Complete {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: CompletePayload,
    },
    Error {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: ErrorPayload,
    },
}

impl ServerFrame {
    pub fn status(stream_id: impl Into<String>, status: TaskStatus) -> Self {
        Self::Status {
            stream_id: stream_id.into(),
            payload: StatusPayload { status },
        }
    }

    pub fn metadata(stream_id: impl Into<String>, columns: Vec<String>) -> Self {
        Self::Metadata {
            stream_id: stream_id.into(),
            payload: MetadataPayload {
                metadata: ColumnsMeta {
                    columns,
                    total_rows: Some(0),
                },
            },
        }
    }

    pub fn row(stream_id: impl Into<String>, row: &[Value]) -> Self {
        Self::Row {
            stream_id: stream_id.into(),
            payload: RowPayload {
                data: row.iter().map(Value::to_json).collect(),
            },
        }
    }

    pub fn complete(stream_id: impl Into<String>, total_rows: u64) -> Self {
        Self::Complete {
            stream_id: stream_id.into(),
            payload: CompletePayload { total_rows },
        }
    }

    pub fn error(stream_id: impl Into<String>, err: &GatewayError) -> Self {
        Self::Error {
            stream_id: stream_id.into(),
            payload: ErrorPayload {
                error: err.to_string(),
                code: Some(err.code().to_string()),
            },
        }
    }

    pub fn protocol_error(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            stream_id: stream_id.into(),
            payload: ErrorPayload {
                error: message.into(),
                code: Some("ProtocolError".to_string()),
            },
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Status { stream_id, .. }
            | Self::Metadata { stream_id, .. }
            | Self::Row { stream_id, .. }
            | Self::Complete { stream_id, .. }
            | Self::Error { stream_id, .. } => stream_id,
        }
    }
}

/// Failure to decode an inbound frame.
///
/// `stream_id` is salvaged from the raw JSON when present so the
/// connection can answer with an `error` frame instead of closing the
/// transport.
#[derive(Debug)]
pub struct FrameDecodeError {
    pub message: String,
    pub stream_id: Option<String>,
}

/// Decode one inbound text message into a [`ClientFrame`].
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameDecodeError> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            let stream_id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| {
                    v.get("streamId")
                        .and_then(|s| s.as_str())
                        .map(str::to_string)
                });
            Err(FrameDecodeError {
                message: format!("malformed frame: {e}"),
                stream_id,
            })
        }
    }
}
