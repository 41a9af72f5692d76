//! # omnigate-protocol
//!
//! MCP (Model Context Protocol) wire types used on both sides of the
//! gateway: JSON-RPC 2.0 envelopes, the MCP entity and request/result
//! types, and protocol version negotiation.

pub mod jsonrpc;
pub mod types;
pub mod versioning;

pub use jsonrpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion,
};
pub use versioning::{negotiate_version, ProtocolVersion, LATEST_VERSION, SUPPORTED_VERSIONS};

/// JSON-RPC method names the gateway dispatches.
pub mod methods {
    /// Initialize handshake
    pub const INITIALIZE: &str = "initialize";
    /// Post-initialize notification
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness probe
    pub const PING: &str = "ping";
    /// List tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool
    pub const TOOLS_CALL: &str = "tools/call";
    /// List prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Fetch one prompt
    pub const PROMPTS_GET: &str = "prompts/get";
    /// List resources
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Read one resource
    pub const RESOURCES_READ: &str = "resources/read";
    /// List resource templates
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Client-side cancellation
    pub const CANCELLED: &str = "notifications/cancelled";
}
