//! Protocol version negotiation.
//!
//! MCP versions are dates (`YYYY-MM-DD`). The gateway accepts any version
//! in its known set; an unknown client version degrades to the oldest
//! supported one so older clients keep working.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Versions the gateway speaks, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Newest supported protocol version.
pub const LATEST_VERSION: &str = SUPPORTED_VERSIONS[0];

/// A protocol version date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(String);

impl ProtocolVersion {
    /// The version string as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this version is in the supported set.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(&self.0.as_str())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version parse failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid protocol version '{0}': expected YYYY-MM-DD")]
pub struct VersionParseError(String);

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let valid = parts.len() == 3
            && parts[0].len() == 4
            && parts[1].len() == 2
            && parts[2].len() == 2
            && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(VersionParseError(s.to_string()))
        }
    }
}

/// Pick the version to answer an `initialize` with.
///
/// A known client version is echoed back; anything else (including
/// unparseable strings) degrades to the oldest supported version.
#[must_use]
pub fn negotiate_version(client_version: &str) -> ProtocolVersion {
    if SUPPORTED_VERSIONS.contains(&client_version) {
        return ProtocolVersion(client_version.to_string());
    }
    let oldest = SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1];
    tracing::debug!(
        client = %client_version,
        negotiated = %oldest,
        "unknown protocol version from client, degrading"
    );
    ProtocolVersion(oldest.to_string())
}
