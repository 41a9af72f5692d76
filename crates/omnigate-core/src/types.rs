//! Core identifier types shared across the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// JSON-RPC request identifier.
///
/// The wire format allows both string and integer ids; both forms are kept
/// verbatim so responses echo exactly what the client sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl RequestId {
    /// Render the id for log correlation.
    #[must_use]
    pub fn as_log_value(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// Opaque session identifier, unique process-wide and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse a client-echoed session id.
    ///
    /// Ids are opaque; the only requirement is that they are non-empty and
    /// free of control characters (they travel in HTTP headers).
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.chars().any(|c| c.is_control()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// The id as a header-safe string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrip() {
        let s: RequestId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(s, RequestId::String("abc".to_string()));
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"abc\"");

        let n: RequestId = serde_json::from_str("7").unwrap();
        assert_eq!(n, RequestId::Number(7));
        assert_eq!(serde_json::to_string(&n).unwrap(), "7");
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_rejects_control_chars() {
        assert!(SessionId::parse("ok-id").is_some());
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse("bad\r\nid").is_none());
    }
}
