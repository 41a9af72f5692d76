//! # omnigate-transport
//!
//! Outbound connections to external MCP servers. Three transports share
//! one capability set ([`OutboundTransport`]): a stdio child process, an
//! HTTP+SSE client, and a streamable-HTTP client. On top of them sit
//! concurrent capability fetching and the on-demand transport pool.

pub mod capabilities;
pub mod core;
pub mod pool;
pub mod sse_codec;
pub mod sse_transport;
pub mod stdio;
pub mod streamable;

pub use capabilities::{fetch_capabilities, CapabilityFetchOutcome, CapabilityKind};
pub use core::{OutboundTransport, TransportError, TransportResult};
pub use pool::{TransportPool, TransportPoolConfig};
pub use sse_transport::{SseTransport, SseTransportConfig};
pub use stdio::{StdioTransport, StdioTransportConfig};
pub use streamable::{StreamableTransport, StreamableTransportConfig};
