//! Versioned, tenant-scoped configuration storage.
//!
//! Two backends satisfy [`ConfigStore`]: a YAML-directory store for
//! deployments and a full-fidelity in-memory store for tests and
//! embedders. Updates are transactional in effect: the live row and the
//! appended version move together, and exactly one version per
//! `(tenant, name)` is active at any time.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    CapabilitiesInfo, McpConfig, SyncHistory, Tenant, ToolStatusHistory, ToolStatusOverride,
};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store failure modes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The write conflicts with existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored YAML could not be parsed
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Stored JSON metadata could not be parsed
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    /// Convenience constructor for missing rows.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Convenience constructor for conflicting writes.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

/// An immutable config snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVersion {
    /// Owning tenant
    pub tenant: String,
    /// Config name
    pub name: String,
    /// Monotonic version number, starting at 1
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Operator who created the version
    pub created_by: String,
    /// Whether this version is the active one
    pub is_active: bool,
    /// The stored YAML blob, byte-for-byte
    pub yaml: String,
    /// Hex SHA-256 of the blob
    pub hash: String,
}

/// Versioned CRUD over tenant-scoped configs, plus the adjacent control
/// plane records (tool-status overrides, capability cache, sync history).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// List known tenants.
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;

    /// Create or replace a tenant.
    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()>;

    /// Create a new config; fails with [`StoreError::Conflict`] when a
    /// live config with the same `(tenant, name)` exists.
    async fn create(&self, config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion>;

    /// Fetch the live config.
    async fn get(&self, tenant: &str, name: &str) -> StoreResult<McpConfig>;

    /// List live configs, optionally including soft-deleted ones.
    async fn list(&self, include_deleted: bool) -> StoreResult<Vec<McpConfig>>;

    /// List configs updated at or after `since` (notifier catch-up path).
    async fn list_updated(&self, since: DateTime<Utc>) -> StoreResult<Vec<McpConfig>>;

    /// Supersede the live row and append a new active version.
    async fn update(&self, config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion>;

    /// Soft-delete: marks `deleted_at`, keeps version history.
    async fn delete(&self, tenant: &str, name: &str) -> StoreResult<()>;

    /// List all versions, newest last.
    async fn list_versions(&self, tenant: &str, name: &str) -> StoreResult<Vec<ConfigVersion>>;

    /// Fetch one version.
    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: u64,
    ) -> StoreResult<ConfigVersion>;

    /// Flip the active flag to `version`, deactivating the previous
    /// active version, and return the YAML blob for the caller to reload.
    async fn set_active_version(
        &self,
        tenant: &str,
        name: &str,
        version: u64,
    ) -> StoreResult<String>;

    /// Apply a tool enable/disable override and append the audit row.
    async fn set_tool_status(
        &self,
        tenant: &str,
        server: &str,
        tool: &str,
        enabled: bool,
        user_id: &str,
        reason: Option<String>,
    ) -> StoreResult<ToolStatusOverride>;

    /// Current overrides for a tenant.
    async fn tool_overrides(&self, tenant: &str) -> StoreResult<Vec<ToolStatusOverride>>;

    /// Audit trail for a tenant's overrides.
    async fn tool_status_history(&self, tenant: &str) -> StoreResult<Vec<ToolStatusHistory>>;

    /// Replace the capability cache for `(tenant, server)`.
    async fn save_capabilities(
        &self,
        tenant: &str,
        server: &str,
        info: CapabilitiesInfo,
    ) -> StoreResult<()>;

    /// Read the capability cache for `(tenant, server)`.
    async fn get_capabilities(
        &self,
        tenant: &str,
        server: &str,
    ) -> StoreResult<Option<CapabilitiesInfo>>;

    /// Record (or update, by `sync_id`) a capability sync run.
    async fn record_sync(&self, entry: SyncHistory) -> StoreResult<()>;

    /// Sync runs for `(tenant, server)`, oldest first.
    async fn list_sync_history(&self, tenant: &str, server: &str) -> StoreResult<Vec<SyncHistory>>;
}
