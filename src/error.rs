//! Error types for the analysis bridge

use serde_json::Value as JsonValue;
use thiserror::Error;

/// JSON-RPC parse error code
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC method not found code
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC internal error code
pub const INTERNAL_ERROR: i64 = -32603;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("JSON-RPC error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<JsonValue>,
    },

    #[error("Connection to analysis server closed")]
    ProtocolClosed,

    #[error("Process error: {0}")]
    Process(String),

    #[error("Analysis server is not running")]
    NotRunning,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl Error {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Timeouts and the transient internal/parse protocol codes qualify;
    /// every other error is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Protocol { code, .. } => matches!(*code, INTERNAL_ERROR | PARSE_ERROR),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(code: i64) -> Error {
        Error::Protocol {
            code,
            message: "boom".to_string(),
            data: None,
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(protocol(INTERNAL_ERROR).is_retryable());
        assert!(protocol(PARSE_ERROR).is_retryable());
        assert!(!protocol(METHOD_NOT_FOUND).is_retryable());
        assert!(!protocol(-32602).is_retryable());
        assert!(Error::Timeout {
            method: "x".to_string(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!Error::ProtocolClosed.is_retryable());
        assert!(!Error::Process("spawn".to_string()).is_retryable());
    }

    #[test]
    fn test_protocol_display_carries_code() {
        assert_eq!(protocol(-32602).to_string(), "JSON-RPC error -32602: boom");
    }
}
