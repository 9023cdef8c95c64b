//! JSON-RPC 2.0 message model
//!
//! Raw frames are classified exactly once, right after decoding, into the
//! closed [`Message`] union. Everything downstream matches on the variant
//! instead of probing JSON fields.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::{Error, Result};

const JSONRPC_VERSION: &str = "2.0";

/// Request identifier (numeric for our requests, either form for the server's)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id as i64)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// A decoded JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<JsonValue>,
    },
    Response {
        /// `None` when the peer answered with a null id (e.g. it could not parse our request)
        id: Option<RequestId>,
        outcome: std::result::Result<JsonValue, RpcError>,
    },
    Notification {
        method: String,
        params: Option<JsonValue>,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    /// Parse and classify a frame body
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: JsonValue = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Classify an already parsed JSON value
    pub fn from_value(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut obj) = value else {
            return Err(Error::Transport("message is not a JSON object".to_string()));
        };

        let method = match obj.remove("method") {
            None => None,
            Some(JsonValue::String(method)) => Some(method),
            Some(other) => {
                return Err(Error::Transport(format!("method is not a string: {}", other)));
            }
        };

        // Outer option: field present; inner option: non-null
        let id: Option<Option<RequestId>> = match obj.remove("id") {
            None => None,
            Some(JsonValue::Null) => Some(None),
            Some(raw) => Some(Some(serde_json::from_value(raw).map_err(|e| {
                Error::Transport(format!("invalid id: {}", e))
            })?)),
        };

        let params = obj.remove("params");

        match (method, id) {
            (Some(method), Some(Some(id))) => Ok(Message::Request { id, method, params }),
            (Some(method), None) => Ok(Message::Notification { method, params }),
            (Some(method), Some(None)) => Err(Error::Transport(format!(
                "request '{}' carries a null id",
                method
            ))),
            (None, Some(id)) => {
                let outcome = Self::response_outcome(&mut obj)?;
                Ok(Message::Response { id, outcome })
            }
            (None, None) => Err(Error::Transport(
                "message has neither method nor id".to_string(),
            )),
        }
    }

    fn response_outcome(
        obj: &mut Map<String, JsonValue>,
    ) -> Result<std::result::Result<JsonValue, RpcError>> {
        match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => Ok(Ok(result)),
            (None, Some(error)) => {
                let error: RpcError = serde_json::from_value(error)
                    .map_err(|e| Error::Transport(format!("invalid error object: {}", e)))?;
                Ok(Err(error))
            }
            (Some(_), Some(_)) => Err(Error::Transport(
                "response carries both result and error".to_string(),
            )),
            (None, None) => Err(Error::Transport(
                "response carries neither result nor error".to_string(),
            )),
        }
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Message::Request { id, method, params } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("method", method)?;
                if let Some(params) = params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response { id, outcome } => {
                map.serialize_entry("id", id)?;
                match outcome {
                    Ok(result) => map.serialize_entry("result", result)?,
                    Err(error) => map.serialize_entry("error", error)?,
                }
            }
            Message::Notification { method, params } => {
                map.serialize_entry("method", method)?;
                if let Some(params) = params {
                    map.serialize_entry("params", params)?;
                }
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classifies_response_with_null_result() {
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "id": 4, "result": null})).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: Some(RequestId::Number(4)),
                outcome: Ok(JsonValue::Null),
            }
        );
    }

    #[test]
    fn test_classifies_error_response() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "nope", "data": {"m": "x"}}
        }))
        .unwrap();
        match msg {
            Message::Response { outcome: Err(err), .. } => {
                assert_eq!(err.code, -32601);
                assert_eq!(err.data, Some(json!({"m": "x"})));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_response_with_both_result_and_error() {
        let err = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": 1,
            "error": {"code": 1, "message": "x"}
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_classifies_server_request_with_string_id() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "workspace/configuration",
            "params": {}
        }))
        .unwrap();
        assert!(matches!(
            msg,
            Message::Request { id: RequestId::String(ref s), .. } if s == "abc"
        ));
    }

    #[test]
    fn test_notification_serializes_without_id() {
        let value = serde_json::to_value(Message::notification("exit", None)).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "exit"}));
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(Message::from_slice(b"[1,2]").is_err());
        assert!(matches!(Message::from_slice(b"{oops"), Err(Error::Json(_))));
    }
}
