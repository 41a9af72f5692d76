//! In-memory store backend.
//!
//! Full [`ConfigStore`] semantics without persistence; the disk backend's
//! integration tests validate against this one as the reference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{ConfigStore, ConfigVersion, StoreError, StoreResult};
use crate::model::{
    hash_blob, CapabilitiesInfo, McpConfig, SyncHistory, Tenant, ToolStatusHistory,
    ToolStatusOverride,
};

#[derive(Debug, Default)]
struct Row {
    live: McpConfig,
    versions: Vec<ConfigVersion>,
}

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<String, Tenant>,
    rows: HashMap<(String, String), Row>,
    overrides: HashMap<(String, String, String), ToolStatusOverride>,
    override_history: Vec<ToolStatusHistory>,
    capabilities: HashMap<(String, String), CapabilitiesInfo>,
    syncs: Vec<SyncHistory>,
}

/// Thread-safe in-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant: &str, name: &str) -> (String, String) {
        (tenant.to_string(), name.to_string())
    }
}

fn make_version(
    config: &McpConfig,
    version: u64,
    created_by: &str,
) -> Result<ConfigVersion, StoreError> {
    let yaml = config.to_yaml()?;
    let hash = hash_blob(&yaml);
    Ok(ConfigVersion {
        tenant: config.tenant.clone(),
        name: config.name.clone(),
        version,
        created_at: Utc::now(),
        created_by: created_by.to_string(),
        is_active: true,
        yaml,
        hash,
    })
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.inner.read().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        self.inner.write().tenants.insert(tenant.name.clone(), tenant);
        Ok(())
    }

    async fn create(&self, mut config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion> {
        let mut inner = self.inner.write();
        let key = Self::key(&config.tenant, &config.name);
        if let Some(row) = inner.rows.get(&key) {
            if row.live.deleted_at.is_none() {
                return Err(StoreError::conflict(format!(
                    "config '{}/{}' already exists",
                    config.tenant, config.name
                )));
            }
        }
        let now = Utc::now();
        config.created_at = Some(now);
        config.updated_at = Some(now);
        config.deleted_at = None;

        let next = inner
            .rows
            .get(&key)
            .and_then(|r| r.versions.last())
            .map_or(1, |v| v.version + 1);
        let version = make_version(&config, next, created_by)?;

        let row = inner.rows.entry(key).or_default();
        for v in &mut row.versions {
            v.is_active = false;
        }
        row.live = config;
        row.versions.push(version.clone());
        Ok(version)
    }

    async fn get(&self, tenant: &str, name: &str) -> StoreResult<McpConfig> {
        let inner = self.inner.read();
        inner
            .rows
            .get(&Self::key(tenant, name))
            .filter(|row| row.live.deleted_at.is_none())
            .map(|row| row.live.clone())
            .ok_or_else(|| StoreError::not_found(format!("config '{tenant}/{name}'")))
    }

    async fn list(&self, include_deleted: bool) -> StoreResult<Vec<McpConfig>> {
        let inner = self.inner.read();
        let mut configs: Vec<McpConfig> = inner
            .rows
            .values()
            .filter(|row| include_deleted || row.live.deleted_at.is_none())
            .map(|row| row.live.clone())
            .collect();
        configs.sort_by(|a, b| (&a.tenant, &a.name).cmp(&(&b.tenant, &b.name)));
        Ok(configs)
    }

    async fn list_updated(&self, since: DateTime<Utc>) -> StoreResult<Vec<McpConfig>> {
        let inner = self.inner.read();
        Ok(inner
            .rows
            .values()
            .filter(|row| row.live.deleted_at.is_none())
            .filter(|row| row.live.updated_at.is_some_and(|at| at >= since))
            .map(|row| row.live.clone())
            .collect())
    }

    async fn update(&self, mut config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion> {
        let mut inner = self.inner.write();
        let key = Self::key(&config.tenant, &config.name);
        let row = inner
            .rows
            .get_mut(&key)
            .ok_or_else(|| {
                StoreError::not_found(format!("config '{}/{}'", config.tenant, config.name))
            })?;
        config.created_at = row.live.created_at;
        config.updated_at = Some(Utc::now());
        config.deleted_at = None;

        let next = row.versions.last().map_or(1, |v| v.version + 1);
        let version = make_version(&config, next, created_by)?;
        for v in &mut row.versions {
            v.is_active = false;
        }
        row.live = config;
        row.versions.push(version.clone());
        Ok(version)
    }

    async fn delete(&self, tenant: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let row = inner
            .rows
            .get_mut(&Self::key(tenant, name))
            .ok_or_else(|| StoreError::not_found(format!("config '{tenant}/{name}'")))?;
        row.live.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn list_versions(&self, tenant: &str, name: &str) -> StoreResult<Vec<ConfigVersion>> {
        let inner = self.inner.read();
        inner
            .rows
            .get(&Self::key(tenant, name))
            .map(|row| row.versions.clone())
            .ok_or_else(|| StoreError::not_found(format!("config '{tenant}/{name}'")))
    }

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: u64,
    ) -> StoreResult<ConfigVersion> {
        let versions = self.list_versions(tenant, name).await?;
        versions
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                StoreError::not_found(format!("version {version} of '{tenant}/{name}'"))
            })
    }

    async fn set_active_version(
        &self,
        tenant: &str,
        name: &str,
        version: u64,
    ) -> StoreResult<String> {
        let mut inner = self.inner.write();
        let row = inner
            .rows
            .get_mut(&Self::key(tenant, name))
            .ok_or_else(|| StoreError::not_found(format!("config '{tenant}/{name}'")))?;
        let exists = row.versions.iter().any(|v| v.version == version);
        if !exists {
            return Err(StoreError::not_found(format!(
                "version {version} of '{tenant}/{name}'"
            )));
        }
        let mut yaml = String::new();
        for v in &mut row.versions {
            v.is_active = v.version == version;
            if v.is_active {
                yaml = v.yaml.clone();
            }
        }
        // The live row follows the activated version.
        let mut config = McpConfig::from_yaml(&yaml)?;
        config.updated_at = Some(Utc::now());
        row.live = config;
        Ok(yaml)
    }

    async fn set_tool_status(
        &self,
        tenant: &str,
        server: &str,
        tool: &str,
        enabled: bool,
        user_id: &str,
        reason: Option<String>,
    ) -> StoreResult<ToolStatusOverride> {
        let mut inner = self.inner.write();
        let key = (tenant.to_string(), server.to_string(), tool.to_string());
        let old = inner.overrides.get(&key).map(|o| o.enabled);
        let entry = ToolStatusOverride {
            tenant: tenant.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            enabled,
            updated_at: Utc::now(),
        };
        inner.overrides.insert(key, entry.clone());
        inner.override_history.push(ToolStatusHistory {
            tenant: tenant.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            old,
            new: enabled,
            user_id: user_id.to_string(),
            reason,
            at: entry.updated_at,
        });
        Ok(entry)
    }

    async fn tool_overrides(&self, tenant: &str) -> StoreResult<Vec<ToolStatusOverride>> {
        let inner = self.inner.read();
        Ok(inner
            .overrides
            .values()
            .filter(|o| o.tenant == tenant)
            .cloned()
            .collect())
    }

    async fn tool_status_history(&self, tenant: &str) -> StoreResult<Vec<ToolStatusHistory>> {
        let inner = self.inner.read();
        Ok(inner
            .override_history
            .iter()
            .filter(|h| h.tenant == tenant)
            .cloned()
            .collect())
    }

    async fn save_capabilities(
        &self,
        tenant: &str,
        server: &str,
        info: CapabilitiesInfo,
    ) -> StoreResult<()> {
        self.inner
            .write()
            .capabilities
            .insert((tenant.to_string(), server.to_string()), info);
        Ok(())
    }

    async fn get_capabilities(
        &self,
        tenant: &str,
        server: &str,
    ) -> StoreResult<Option<CapabilitiesInfo>> {
        Ok(self
            .inner
            .read()
            .capabilities
            .get(&(tenant.to_string(), server.to_string()))
            .cloned())
    }

    async fn record_sync(&self, entry: SyncHistory) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.syncs.iter_mut().find(|s| s.sync_id == entry.sync_id) {
            *existing = entry;
        } else {
            inner.syncs.push(entry);
        }
        Ok(())
    }

    async fn list_sync_history(&self, tenant: &str, server: &str) -> StoreResult<Vec<SyncHistory>> {
        let inner = self.inner.read();
        Ok(inner
            .syncs
            .iter()
            .filter(|s| s.tenant == tenant && s.server == server)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;

    fn config(tenant: &str, name: &str) -> McpConfig {
        McpConfig {
            name: name.to_string(),
            tenant: tenant.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryStore::new();
        let v = store.create(config("t", "a"), "op").await.unwrap();
        assert_eq!(v.version, 1);
        assert!(v.is_active);
        let live = store.get("t", "a").await.unwrap();
        assert_eq!(live.name, "a");
        assert!(live.created_at.is_some());
    }

    #[tokio::test]
    async fn create_conflicts_with_live_row() {
        let store = MemoryStore::new();
        store.create(config("t", "a"), "op").await.unwrap();
        let err = store.create(config("t", "a"), "op").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_increments_version_and_moves_active_flag() {
        let store = MemoryStore::new();
        store.create(config("t", "a"), "op").await.unwrap();
        let v2 = store.update(config("t", "a"), "op").await.unwrap();
        assert_eq!(v2.version, 2);

        let versions = store.list_versions("t", "a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(!versions[0].is_active);
        assert!(versions[1].is_active);
        assert!(versions[1].version > versions[0].version);
    }

    #[tokio::test]
    async fn delete_is_soft_and_keeps_history() {
        let store = MemoryStore::new();
        store.create(config("t", "a"), "op").await.unwrap();
        store.delete("t", "a").await.unwrap();

        assert!(store.get("t", "a").await.is_err());
        assert_eq!(store.list(false).await.unwrap().len(), 0);
        assert_eq!(store.list(true).await.unwrap().len(), 1);
        assert_eq!(store.list_versions("t", "a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recreate_after_delete_continues_version_numbers() {
        let store = MemoryStore::new();
        store.create(config("t", "a"), "op").await.unwrap();
        store.delete("t", "a").await.unwrap();
        let v = store.create(config("t", "a"), "op").await.unwrap();
        assert_eq!(v.version, 2);
    }

    #[tokio::test]
    async fn set_active_version_rolls_back_live_row() {
        let store = MemoryStore::new();
        let mut first = config("t", "a");
        first.servers.push(crate::model::ServerSpec {
            name: "v1-server".to_string(),
            description: None,
            allowed_tools: vec![],
            config: Default::default(),
        });
        store.create(first, "op").await.unwrap();
        store.update(config("t", "a"), "op").await.unwrap();

        let yaml = store.set_active_version("t", "a", 1).await.unwrap();
        assert!(yaml.contains("v1-server"));

        let versions = store.list_versions("t", "a").await.unwrap();
        let active: Vec<u64> = versions
            .iter()
            .filter(|v| v.is_active)
            .map(|v| v.version)
            .collect();
        assert_eq!(active, vec![1]);
        assert_eq!(store.get("t", "a").await.unwrap().servers.len(), 1);
    }

    #[tokio::test]
    async fn tool_status_override_appends_history() {
        let store = MemoryStore::new();
        store
            .set_tool_status("t", "srv", "ping", false, "op", Some("broken".into()))
            .await
            .unwrap();
        store
            .set_tool_status("t", "srv", "ping", true, "op", None)
            .await
            .unwrap();

        let overrides = store.tool_overrides("t").await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert!(overrides[0].enabled);

        let history = store.tool_status_history("t").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old, None);
        assert_eq!(history[1].old, Some(false));
    }

    #[tokio::test]
    async fn sync_history_updates_by_id() {
        let store = MemoryStore::new();
        let mut entry = SyncHistory {
            sync_id: "s1".to_string(),
            tenant: "t".to_string(),
            server: "srv".to_string(),
            status: SyncStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            progress: 10,
            sync_types: vec!["tools".to_string()],
            summary: serde_json::json!({}),
            error: None,
        };
        store.record_sync(entry.clone()).await.unwrap();
        entry.status = SyncStatus::Success;
        entry.progress = 100;
        store.record_sync(entry).await.unwrap();

        let history = store.list_sync_history("t", "srv").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SyncStatus::Success);
    }
}
