//! Error types for the bridge.
//!
//! `ProtocolError` covers everything a remote process can get wrong about an
//! inbound message and is always turned into an HTTP status at the server
//! boundary. `BridgeError` covers the editor-side failures: network problems
//! talking to an instance, debugger attach, launching, and sequencing mistakes.

use axum::http::{Method, StatusCode};

/// Inbound message rejected before any side effect took place.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("Body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Message has no string 'type' field")]
    MissingType,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolError {
    /// HTTP status mapping
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidJson(_)
            | Self::MissingType
            | Self::UnknownType(_)
            | Self::InvalidField { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::MissingType => "MISSING_TYPE",
            Self::UnknownType(_) => "UNKNOWN_TYPE",
            Self::InvalidField { .. } => "INVALID_FIELD",
        }
    }
}

/// Editor-side failures.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("Transport server is not started")]
    NotStarted,

    #[error("Failed to bind transport server: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Request to {address} failed: {message}")]
    Network { address: String, message: String },

    #[error("Request to {address} returned HTTP {status}")]
    Status { address: String, status: u16 },

    #[error("Request to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Debugger attach failed: {0}")]
    Attach(String),

    #[error("Failed to launch Blender: {0}")]
    Launch(String),

    #[error("Invalid response body from {address}: {message}")]
    InvalidResponse { address: String, message: String },
}

impl BridgeError {
    /// Wrap a reqwest failure with the address it was sent to.
    pub fn from_reqwest(err: &reqwest::Error, address: &str) -> Self {
        if let Some(status) = err.status() {
            return Self::Status {
                address: address.to_string(),
                status: status.as_u16(),
            };
        }
        Self::Network {
            address: address.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_client_statuses() {
        assert_eq!(
            ProtocolError::MethodNotAllowed(Method::GET).status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ProtocolError::InvalidJson("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProtocolError::MissingType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProtocolError::UnknownType("nope".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        let invalid = ProtocolError::InvalidField {
            field: "blenderPort",
            reason: "missing".into(),
        };
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.error_code(), "INVALID_FIELD");
    }

    #[test]
    fn display_includes_address() {
        let err = BridgeError::Status {
            address: "http://localhost:4000".into(),
            status: 500,
        };
        assert_eq!(err.to_string(), "Request to http://localhost:4000 returned HTTP 500");
    }
}
