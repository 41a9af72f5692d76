//! Gateway error types and their JSON-RPC mapping.

use serde_json::{json, Value};

use omnigate_config::{StoreError, ValidationError};
use omnigate_core::truncate_utf8;
use omnigate_protocol::jsonrpc::{codes, JsonRpcError};
use omnigate_template::RenderError;
use omnigate_transport::TransportError;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Upstream bodies reflected into error payloads are truncated to this.
const ERROR_BODY_LIMIT: usize = 2048;

/// Everything that can go wrong on the data plane.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Config failed universe validation
    #[error("configuration invalid: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    /// No route matched the request path
    #[error("no route for path '{0}'")]
    RouteNotFound(String),

    /// Unknown JSON-RPC method
    #[error("method '{0}' not found")]
    MethodNotFound(String),

    /// Request parameters failed validation
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A named entity (prompt, resource, backend) is not in the config
    #[error("{0} not found")]
    NotFound(String),

    /// The requested tool is not in the active config
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// The requested tool is masked by a status override
    #[error("tool '{0}' is disabled")]
    ToolDisabled(String),

    /// The session id is unknown or expired
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// A template failed to render at runtime
    #[error(transparent)]
    Template(#[from] RenderError),

    /// The upstream HTTP endpoint answered outside 2xx
    #[error("upstream returned {status}")]
    UpstreamStatus {
        /// HTTP status code
        status: u16,
        /// Truncated upstream body
        body: String,
    },

    /// The outbound transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The upstream call exceeded its deadline
    #[error("upstream call timed out")]
    Timeout,

    /// The caller went away mid-flight
    #[error("request cancelled")]
    Cancelled,

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    /// Wrap an upstream HTTP failure, truncating the reflected body.
    pub fn upstream_status(status: u16, body: &str) -> Self {
        Self::UpstreamStatus {
            status,
            body: truncate_utf8(body, ERROR_BODY_LIMIT).to_string(),
        }
    }

    /// Stable JSON-RPC code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::RouteNotFound(_) | Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::ToolNotFound(_) => codes::TOOL_NOT_FOUND,
            Self::ToolDisabled(_) => codes::TOOL_DISABLED,
            Self::Template(_) => codes::TEMPLATE_ERROR,
            Self::NotFound(_) => codes::UPSTREAM_ERROR,
            Self::UpstreamStatus { .. } | Self::Timeout | Self::Cancelled => codes::UPSTREAM_ERROR,
            Self::Transport(e) => match e {
                TransportError::Timeout | TransportError::Cancelled => codes::UPSTREAM_ERROR,
                TransportError::Upstream { .. } => codes::UPSTREAM_ERROR,
                _ => codes::UPSTREAM_ERROR,
            },
            Self::SessionNotFound(_) => codes::INVALID_REQUEST,
            Self::Store(StoreError::NotFound(_)) => codes::UPSTREAM_ERROR,
            Self::Store(_) | Self::Serialization(_) | Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Structured `data` payload for the JSON-RPC error object.
    fn error_data(&self) -> Option<Value> {
        match self {
            Self::UpstreamStatus { status, body } => {
                Some(json!({"status": status, "body": body}))
            }
            Self::Timeout => Some(json!({"reason": "timeout"})),
            Self::Cancelled => Some(json!({"reason": "cancelled"})),
            Self::Transport(TransportError::Timeout) => Some(json!({"reason": "timeout"})),
            Self::Transport(TransportError::Cancelled) => Some(json!({"reason": "cancelled"})),
            Self::Transport(TransportError::Upstream { code, message, data }) => Some(json!({
                "upstream": {"code": code, "message": message, "data": data}
            })),
            Self::Template(e) => Some(json!({"step": e.step, "cause": e.cause})),
            Self::Validation(errors) => serde_json::to_value(errors).ok(),
            _ => None,
        }
    }

    /// Convert into the wire error object.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.error_code(), self.to_string(), self.error_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_matches_contract() {
        assert_eq!(GatewayError::ToolNotFound("x".into()).error_code(), -32001);
        assert_eq!(GatewayError::ToolDisabled("x".into()).error_code(), -32002);
        assert_eq!(
            GatewayError::MethodNotFound("m".into()).error_code(),
            -32601
        );
        assert_eq!(GatewayError::Timeout.error_code(), -32000);
        assert_eq!(GatewayError::Internal("x".into()).error_code(), -32603);
    }

    #[test]
    fn upstream_error_carries_status_and_body() {
        let err = GatewayError::upstream_status(502, "bad gateway");
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32000);
        let data = rpc.data.unwrap();
        assert_eq!(data["status"], 502);
        assert_eq!(data["body"], "bad gateway");
    }

    #[test]
    fn oversized_upstream_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        let err = GatewayError::upstream_status(500, &body);
        let GatewayError::UpstreamStatus { body, .. } = &err else {
            panic!("wrong variant");
        };
        assert_eq!(body.len(), 2048);
    }

    #[test]
    fn cancellation_is_never_success_shaped() {
        let rpc = GatewayError::Cancelled.to_rpc_error();
        assert_eq!(rpc.code, -32000);
        assert_eq!(rpc.data.unwrap()["reason"], "cancelled");
    }
}
