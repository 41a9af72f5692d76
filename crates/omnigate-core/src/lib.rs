//! # omnigate-core
//!
//! Shared building blocks for the omnigate MCP gateway: request/session
//! identifiers, the bounded event ring used by resumable sessions, and the
//! retry policy applied to idempotent upstream calls.

pub mod ring;
pub mod types;
pub mod util;

pub use ring::{EventRing, RingPush};
pub use types::{RequestId, SessionId};
pub use util::{truncate_utf8, RetryPolicy};

/// Gateway name reported in `initialize` results and logs.
pub const GATEWAY_NAME: &str = "omnigate";

/// Gateway version, overridable at runtime via `APP_VERSION`.
pub fn gateway_version() -> String {
    std::env::var("APP_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}
