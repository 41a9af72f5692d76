//! The outbound transport capability set and its error model.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use omnigate_protocol::jsonrpc::JsonRpcError;
use omnigate_protocol::types::{
    CallToolRequest, CallToolResult, Implementation, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt, Resource,
    ResourceTemplate, Tool,
};
use omnigate_template::RenderContext;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Default deadline for a single upstream JSON-RPC exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport failure modes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be brought up
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation ran against a stopped transport
    #[error("transport is not running")]
    NotRunning,

    /// The peer closed the connection mid-exchange
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The upstream returned a JSON-RPC error object
    #[error("upstream error {code}: {message}")]
    Upstream {
        /// JSON-RPC error code from the upstream
        code: i32,
        /// Upstream error message
        message: String,
        /// Upstream error data, if any
        data: Option<Value>,
    },

    /// The exchange exceeded its deadline
    #[error("request timed out")]
    Timeout,

    /// The exchange was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// The peer broke protocol framing
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HTTP-level failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Process/pipe failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionLost(_) | Self::Timeout | Self::Http(_)
        )
    }

    pub(crate) fn from_rpc_error(error: JsonRpcError) -> Self {
        Self::Upstream {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Capability set shared by every outbound transport.
///
/// `request` is the single primitive: one JSON-RPC exchange with the
/// upstream. The capability fetchers and `call_tool` are defined on top
/// of it so each transport only implements lifecycle and framing.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Bring the transport up and run the `initialize` handshake.
    ///
    /// Header templates in the backend definition are rendered against
    /// `tmpl` (server config and gateway environment).
    async fn start(&self, tmpl: &RenderContext) -> TransportResult<()>;

    /// Tear the transport down, releasing the subprocess/connection.
    async fn stop(&self) -> TransportResult<()>;

    /// Whether the transport is currently usable.
    fn is_running(&self) -> bool;

    /// Identity reported by the upstream during `initialize`, if started.
    fn server_info(&self) -> Option<Implementation>;

    /// Perform one JSON-RPC request and await its result value.
    async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value>;

    /// Send a one-way notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()>;

    /// Fetch the upstream's tools.
    async fn fetch_tools(&self) -> TransportResult<Vec<Tool>> {
        let value = self.request(omnigate_protocol::methods::TOOLS_LIST, None).await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        Ok(result.tools)
    }

    /// Fetch the upstream's prompts.
    async fn fetch_prompts(&self) -> TransportResult<Vec<Prompt>> {
        let value = self
            .request(omnigate_protocol::methods::PROMPTS_LIST, None)
            .await?;
        let result: ListPromptsResult = serde_json::from_value(value)?;
        Ok(result.prompts)
    }

    /// Fetch the upstream's resources.
    async fn fetch_resources(&self) -> TransportResult<Vec<Resource>> {
        let value = self
            .request(omnigate_protocol::methods::RESOURCES_LIST, None)
            .await?;
        let result: ListResourcesResult = serde_json::from_value(value)?;
        Ok(result.resources)
    }

    /// Fetch the upstream's resource templates.
    async fn fetch_resource_templates(&self) -> TransportResult<Vec<ResourceTemplate>> {
        let value = self
            .request(omnigate_protocol::methods::RESOURCES_TEMPLATES_LIST, None)
            .await?;
        let result: ListResourceTemplatesResult = serde_json::from_value(value)?;
        Ok(result.resource_templates)
    }

    /// Invoke a tool on the upstream.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> TransportResult<CallToolResult> {
        let params = serde_json::to_value(CallToolRequest {
            name: name.to_string(),
            arguments,
        })?;
        let value = self
            .request(omnigate_protocol::methods::TOOLS_CALL, Some(params))
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Build the `initialize` parameters every transport sends.
pub(crate) fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": omnigate_protocol::LATEST_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": omnigate_core::GATEWAY_NAME,
            "version": omnigate_core::gateway_version(),
        },
    })
}

/// Extract `serverInfo` out of an `initialize` result value.
pub(crate) fn parse_server_info(result: &Value) -> Option<Implementation> {
    serde_json::from_value(result.get("serverInfo")?.clone()).ok()
}

/// Route one received JSON-RPC payload to its pending waiter.
///
/// Upstreams interleave responses with server-initiated requests and
/// notifications on the same channel; anything that is not a response to
/// one of our numeric ids is ignored here.
pub(crate) fn route_response_line(
    pending: &dashmap::DashMap<i64, tokio::sync::oneshot::Sender<omnigate_protocol::jsonrpc::JsonRpcResponse>>,
    line: &str,
) {
    use omnigate_core::RequestId;

    let Ok(response) =
        serde_json::from_str::<omnigate_protocol::jsonrpc::JsonRpcResponse>(line)
    else {
        tracing::trace!("ignoring non-response upstream payload");
        return;
    };
    if response.result.is_none() && response.error.is_none() {
        return;
    }
    let Some(RequestId::Number(id)) = response.id.clone() else {
        tracing::trace!("upstream response with unknown id shape");
        return;
    };
    if let Some((_, waiter)) = pending.remove(&id) {
        let _ = waiter.send(response);
    } else {
        tracing::trace!(id, "upstream response with no pending waiter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ConnectionLost("pipe".into()).is_transient());
        assert!(!TransportError::Upstream {
            code: -32601,
            message: "nope".into(),
            data: None
        }
        .is_transient());
        assert!(!TransportError::Cancelled.is_transient());
    }

    #[test]
    fn initialize_params_carry_gateway_identity() {
        let params = initialize_params();
        assert_eq!(
            params["protocolVersion"],
            omnigate_protocol::LATEST_VERSION
        );
        assert_eq!(params["clientInfo"]["name"], "omnigate");
    }
}
