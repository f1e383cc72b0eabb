//! Wire envelopes.
//!
//! Every broker message body is a UTF-8 JSON object:
//! - task: `{"id", "task", "args", "kwargs"}`
//! - result: `{"status": "SUCCESS"|"FAILURE", "result"}`
//! - event: `{"event_id", "name", "date", "payload"}`

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{translate_failure, FatmouseError, Result};

/// A task submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Correlation id; also the reply queue name and binding key.
    pub id: String,
    pub task: String,
    /// Positional arguments. Always empty for tasks sent by this client.
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskEnvelope {
    pub fn new(id: impl Into<String>, task: impl Into<String>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            args: Vec::new(),
            kwargs,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| FatmouseError::InvalidInput(format!("task envelope not encodable: {}", e)))
    }
}

/// Result status reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// A task result as delivered on the reply queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Value,
}

impl ResultEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| FatmouseError::decode("result envelope", e))
    }

    /// Turn the envelope into the decoded success value or the remote error.
    pub fn into_outcome<T: DeserializeOwned>(self) -> Result<T> {
        match self.status {
            ResultStatus::Success => decode_value(self.result, "result value"),
            ResultStatus::Failure => Err(translate_failure(self.result)),
        }
    }
}

/// A server-originated event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_optional_date")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| FatmouseError::decode("event envelope", e))
    }
}

/// Decode a JSON value into `T`, reporting `what` on failure.
pub fn decode_value<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| FatmouseError::decode(what, e))
}

/// Decode a raw JSON body into `T`.
pub fn decode_body<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| FatmouseError::decode(what, e))
}

/// Encode caller-supplied keyword arguments.
///
/// The value must serialize to a JSON object; `null` (e.g. `()`) stands for
/// no arguments.
pub fn encode_kwargs<K: Serialize + ?Sized>(kwargs: &K) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(kwargs)
        .map_err(|e| FatmouseError::InvalidInput(format!("kwargs not serializable: {}", e)))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(FatmouseError::InvalidInput(format!(
            "kwargs must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Serde adapter for optional ISO-8601 dates (`null` and absent are `None`).
pub fn deserialize_optional_date<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_date(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{}'", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_task_envelope_wire_shape() {
        let kwargs = encode_kwargs(&json!({"server_id": "srv-1"})).unwrap();
        let envelope = TaskEnvelope::new("abc", "deregister_server", kwargs);
        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({
                "id": "abc",
                "task": "deregister_server",
                "args": [],
                "kwargs": {"server_id": "srv-1"}
            })
        );
    }

    #[test]
    fn test_encode_kwargs_null_is_empty() {
        assert!(encode_kwargs(&()).unwrap().is_empty());
    }

    #[test]
    fn test_encode_kwargs_rejects_non_object() {
        let err = encode_kwargs(&vec![1, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("array"));
    }

    #[test]
    fn test_encode_kwargs_from_struct() {
        #[derive(Serialize)]
        struct Hostname<'a> {
            hostname: &'a str,
        }
        let map = encode_kwargs(&Hostname { hostname: "h" }).unwrap();
        assert_eq!(map.get("hostname"), Some(&json!("h")));
    }

    #[test]
    fn test_success_envelope_decodes_value() {
        let envelope =
            ResultEnvelope::from_slice(br#"{"status":"SUCCESS","result":{"username":"srv-1"}}"#)
                .unwrap();
        let value: Value = envelope.into_outcome().unwrap();
        assert_eq!(value["username"], "srv-1");
    }

    #[test]
    fn test_failure_envelope_is_remote_error() {
        let envelope = ResultEnvelope::from_slice(
            br#"{"status":"FAILURE","result":{"exc_type":"DuplicateError","exc_message":"already exists","exc_data":{"id":"srv-1"}}}"#,
        )
        .unwrap();
        let err = envelope.into_outcome::<Value>().unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.error_type(), "DuplicateError");
        assert_eq!(remote.message(), "already exists");
        assert_eq!(remote.data(), Some(&json!({"id": "srv-1"})));
    }

    #[test]
    fn test_unknown_status_is_decode_failure() {
        let err = ResultEnvelope::from_slice(br#"{"status":"PENDING","result":null}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[test]
    fn test_invalid_json_is_decode_failure() {
        let err = ResultEnvelope::from_slice(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[test]
    fn test_success_with_wrong_shape_is_decode_failure() {
        #[derive(Debug, Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            username: String,
        }
        let envelope = ResultEnvelope::from_slice(br#"{"status":"SUCCESS","result":42}"#).unwrap();
        let err = envelope.into_outcome::<Expected>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[test]
    fn test_event_envelope_without_date() {
        let envelope = EventEnvelope::from_slice(
            br#"{"event_id":"e1","name":"reboot_complete","payload":{"server_id":"srv-1"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event_id, "e1");
        assert_eq!(envelope.date, None);
        assert_eq!(envelope.payload["server_id"], "srv-1");
    }

    #[test]
    fn test_event_envelope_with_null_date() {
        let envelope =
            EventEnvelope::from_slice(br#"{"event_id":"e1","name":"x","date":null,"payload":{}}"#)
                .unwrap();
        assert_eq!(envelope.date, None);
    }

    #[test]
    fn test_event_envelope_rejects_bad_date() {
        let err =
            EventEnvelope::from_slice(br#"{"event_id":"e1","name":"x","date":"yesterday"}"#)
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_date("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_date("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_date("2024-03-01T12:30:00"), Some(expected));
        assert_eq!(parse_date("2024-03-01 12:30:00.000"), Some(expected));
        assert_eq!(parse_date("March 1st"), None);
    }
}
