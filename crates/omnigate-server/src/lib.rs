//! # omnigate-server
//!
//! The gateway's data plane: a compiled routing snapshot with atomic hot
//! reload, per-client MCP sessions (SSE and streamable-HTTP), the tool
//! invoker that turns `tools/call` into templated HTTP requests, and the
//! JSON-RPC dispatcher tying it all together behind an axum surface.

pub mod dispatch;
pub mod error;
pub mod http;
pub mod invoke;
pub mod session;
pub mod snapshot;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use http::{router, serve, LAST_EVENT_ID_HEADER, MCP_SESSION_HEADER};
pub use invoke::{InboundRequest, ToolInvoker};
pub use session::{Session, SessionProtocol, SessionRegistry, SessionRegistryConfig};
pub use snapshot::{CompiledRoute, CompiledTool, RoutingSnapshot};
pub use state::{GatewayConfig, GatewayState};
