use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Portable row value crossing the driver boundary.
///
/// Custom enum instead of `serde_json::Value` so drivers can coerce
/// backend-native wrappers (binary decimals, timestamp containers, 16-byte
/// uuids) into a fixed set of primitives without leaking backend types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Decimal stored as string to preserve exact precision.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// Timestamp in UTC.
    Timestamp(DateTime<Utc>),
    /// Date without time component.
    Date(NaiveDate),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire representation: plain JSON primitives, no variant tags.
    ///
    /// Numbers stay numbers, decimals and temporals become strings
    /// (RFC 3339 for timestamps), bytes become a hex string. Decoding a
    /// portable value and re-encoding yields the same JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => serde_json::Value::String(d.clone()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        }
    }

    pub fn as_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.clone(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Uuid(u) => u.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_display_string())
    }
}

/// One row of portable values, in backend-native column order.
pub type Row = Vec<Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wire_json_uses_plain_primitives() {
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
        assert_eq!(Value::Bool(true).to_json(), serde_json::json!(true));
        assert_eq!(Value::Int(42).to_json(), serde_json::json!(42));
        assert_eq!(Value::Float(1.5).to_json(), serde_json::json!(1.5));
        assert_eq!(
            Value::Text("alpha".into()).to_json(),
            serde_json::json!("alpha")
        );
        assert_eq!(
            Value::Decimal("12345.6789".into()).to_json(),
            serde_json::json!("12345.6789")
        );
    }

    #[test]
    fn bytes_encode_as_hex() {
        assert_eq!(
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]).to_json(),
            serde_json::json!("deadbeef")
        );
    }

    #[test]
    fn timestamp_encodes_as_rfc3339_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(
            Value::Timestamp(ts).to_json(),
            serde_json::json!("2024-03-01T12:30:00Z")
        );
    }

    #[test]
    fn nan_float_degrades_to_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn wire_encoding_is_idempotent() {
        let values = vec![
            Value::Int(7),
            Value::Decimal("0.1".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()),
            Value::Uuid(Uuid::nil()),
        ];
        for value in values {
            let first = value.to_json();
            let second = value.to_json();
            assert_eq!(first, second);
        }
    }
}
