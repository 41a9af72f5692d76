//! Config-change pub/sub between the control plane and running replicas.
//!
//! A notifier may be send-capable, receive-capable, or both. Delivery is
//! at-least-once and ordering is best-effort; receivers dedupe by config
//! hash and can fall back to `ConfigStore::list_updated` after a miss.

mod file;
mod signal;

#[path = "redis.rs"]
mod redis_impl;

pub use file::FileNotifier;
pub use redis_impl::RedisNotifier;
pub use signal::SignalNotifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::McpConfig;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigEventKind {
    /// A config was created or updated
    Update,
    /// A config was deleted
    Delete,
    /// Receivers should re-fetch everything
    ReloadAll,
}

/// One change notification. `config` is absent for reload-all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEvent {
    /// Event kind
    #[serde(rename = "event")]
    pub kind: ConfigEventKind,
    /// The changed config, when the sender knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<McpConfig>,
}

impl ConfigEvent {
    /// A reload-all event.
    #[must_use]
    pub fn reload_all() -> Self {
        Self {
            kind: ConfigEventKind::ReloadAll,
            config: None,
        }
    }

    /// An update event carrying the new config.
    #[must_use]
    pub fn update(config: McpConfig) -> Self {
        Self {
            kind: ConfigEventKind::Update,
            config: Some(config),
        }
    }

    /// A delete event carrying the removed config.
    #[must_use]
    pub fn delete(config: McpConfig) -> Self {
        Self {
            kind: ConfigEventKind::Delete,
            config: Some(config),
        }
    }
}

/// Notifier failure modes.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    /// The notifier lacks the requested capability
    #[error("notifier cannot {0}")]
    Unsupported(&'static str),

    /// Required environment is missing
    #[error("missing environment: {0}")]
    MissingEnv(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Watcher setup failure
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Redis failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event encoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Signal delivery failure
    #[error("signal error: {0}")]
    Signal(String),
}

/// Bidirectional pub/sub for config changes.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether [`Notifier::notify`] is supported.
    fn can_send(&self) -> bool;

    /// Whether [`Notifier::subscribe`] yields events.
    fn can_receive(&self) -> bool;

    /// Publish a change event.
    async fn notify(&self, event: ConfigEvent) -> Result<(), NotifierError>;

    /// Subscribe to incoming change events.
    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent>;
}

/// Capacity of the per-notifier broadcast channel. A replica that lags
/// this far behind simply performs a reload-all on the next event.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_matches_contract() {
        let event = ConfigEvent::reload_all();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"event": "reload-all"}));

        let update = ConfigEvent::update(McpConfig {
            name: "a".to_string(),
            tenant: "t".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["event"], "update");
        assert_eq!(json["config"]["name"], "a");
    }
}
