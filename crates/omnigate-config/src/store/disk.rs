//! YAML-directory store backend.
//!
//! One YAML file per live config under `<root>/<tenant>/<name>.yaml`,
//! immutable version blobs under `<root>/<tenant>/.versions/<name>/`, and
//! JSON sidecars under `<root>/<tenant>/.meta/` for version metadata,
//! tool-status overrides, the capability cache, and sync history. Every
//! write goes through a temp file, fsync and rename so a crash never
//! leaves a half-written blob, and all mutations are serialized on one
//! async mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ConfigStore, ConfigVersion, StoreError, StoreResult};
use crate::model::{
    hash_blob, CapabilitiesInfo, McpConfig, SyncHistory, Tenant, ToolStatusHistory,
    ToolStatusOverride,
};

/// Filesystem-backed [`ConfigStore`] rooted at a directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionMeta {
    version: u64,
    created_at: DateTime<Utc>,
    created_by: String,
    hash: String,
    is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    versions: Vec<VersionMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolStatusFile {
    overrides: Vec<ToolStatusOverride>,
    history: Vec<ToolStatusHistory>,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn config_path(&self, tenant: &str, name: &str) -> PathBuf {
        self.root.join(tenant).join(format!("{name}.yaml"))
    }

    fn meta_path(&self, tenant: &str, name: &str) -> PathBuf {
        self.root.join(tenant).join(".meta").join(format!("{name}.json"))
    }

    fn version_path(&self, tenant: &str, name: &str, version: u64) -> PathBuf {
        self.root
            .join(tenant)
            .join(".versions")
            .join(name)
            .join(format!("{version}.yaml"))
    }

    fn tenants_path(&self) -> PathBuf {
        self.root.join(".tenants.json")
    }

    fn tool_status_path(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant).join(".meta").join("tool_status.json")
    }

    fn capabilities_path(&self, tenant: &str, server: &str) -> PathBuf {
        self.root
            .join(tenant)
            .join(".meta")
            .join("capabilities")
            .join(format!("{server}.json"))
    }

    fn sync_path(&self, tenant: &str, sync_id: &str) -> PathBuf {
        self.root
            .join(tenant)
            .join(".meta")
            .join("sync")
            .join(format!("{sync_id}.json"))
    }

    async fn read_meta(&self, tenant: &str, name: &str) -> StoreResult<MetaFile> {
        read_json(&self.meta_path(tenant, name))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("config '{tenant}/{name}'")))
    }

    async fn load_config(&self, tenant: &str, name: &str) -> StoreResult<McpConfig> {
        let raw = match tokio::fs::read_to_string(self.config_path(tenant, name)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(format!("config '{tenant}/{name}'")));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(McpConfig::from_yaml(&raw)?)
    }

    async fn append_version(
        &self,
        config: &McpConfig,
        meta: &mut MetaFile,
        created_by: &str,
    ) -> StoreResult<ConfigVersion> {
        let yaml = config.to_yaml()?;
        let hash = hash_blob(&yaml);
        let version = meta.versions.last().map_or(1, |v| v.version + 1);
        let created_at = Utc::now();

        write_atomic(
            &self.version_path(&config.tenant, &config.name, version),
            yaml.as_bytes(),
        )
        .await?;

        for v in &mut meta.versions {
            v.is_active = false;
        }
        meta.versions.push(VersionMeta {
            version,
            created_at,
            created_by: created_by.to_string(),
            hash: hash.clone(),
            is_active: true,
        });
        meta.deleted_at = None;

        write_atomic(
            &self.config_path(&config.tenant, &config.name),
            yaml.as_bytes(),
        )
        .await?;
        write_json(&self.meta_path(&config.tenant, &config.name), meta).await?;

        Ok(ConfigVersion {
            tenant: config.tenant.clone(),
            name: config.name.clone(),
            version,
            created_at,
            created_by: created_by.to_string(),
            is_active: true,
            yaml,
            hash,
        })
    }

    async fn scan_configs(&self) -> StoreResult<Vec<(String, String)>> {
        let mut found = Vec::new();
        let mut tenants = tokio::fs::read_dir(&self.root).await?;
        while let Some(tenant_entry) = tenants.next_entry().await? {
            if !tenant_entry.file_type().await?.is_dir() {
                continue;
            }
            let tenant = tenant_entry.file_name().to_string_lossy().to_string();
            if tenant.starts_with('.') {
                continue;
            }
            let mut files = tokio::fs::read_dir(tenant_entry.path()).await?;
            while let Some(entry) = files.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if let Some(name) = file_name.strip_suffix(".yaml") {
                    found.push((tenant.clone(), name.to_string()));
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn check_component(value: &str, what: &str) -> StoreResult<()> {
    if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\']) {
        return Err(StoreError::conflict(format!(
            "{what} '{value}' is not a valid path component"
        )));
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::conflict("path has no parent directory".to_string()))?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> StoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ConfigStore for DiskStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        Ok(read_json(&self.tenants_path()).await?.unwrap_or_default())
    }

    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tenants: Vec<Tenant> = read_json(&self.tenants_path()).await?.unwrap_or_default();
        tenants.retain(|t| t.name != tenant.name);
        tenants.push(tenant);
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        write_json(&self.tenants_path(), &tenants).await
    }

    async fn create(&self, mut config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion> {
        check_component(&config.tenant, "tenant")?;
        check_component(&config.name, "config name")?;
        let _guard = self.write_lock.lock().await;

        let mut meta = read_json::<MetaFile>(&self.meta_path(&config.tenant, &config.name))
            .await?
            .unwrap_or_default();
        if !meta.versions.is_empty() && meta.deleted_at.is_none() {
            return Err(StoreError::conflict(format!(
                "config '{}/{}' already exists",
                config.tenant, config.name
            )));
        }
        let now = Utc::now();
        config.created_at = Some(now);
        config.updated_at = Some(now);
        config.deleted_at = None;
        self.append_version(&config, &mut meta, created_by).await
    }

    async fn get(&self, tenant: &str, name: &str) -> StoreResult<McpConfig> {
        let meta = self.read_meta(tenant, name).await?;
        if meta.deleted_at.is_some() {
            return Err(StoreError::not_found(format!("config '{tenant}/{name}'")));
        }
        self.load_config(tenant, name).await
    }

    async fn list(&self, include_deleted: bool) -> StoreResult<Vec<McpConfig>> {
        let mut configs = Vec::new();
        for (tenant, name) in self.scan_configs().await? {
            let meta = self.read_meta(&tenant, &name).await?;
            if meta.deleted_at.is_some() && !include_deleted {
                continue;
            }
            let mut config = self.load_config(&tenant, &name).await?;
            config.deleted_at = meta.deleted_at;
            configs.push(config);
        }
        Ok(configs)
    }

    async fn list_updated(&self, since: DateTime<Utc>) -> StoreResult<Vec<McpConfig>> {
        let configs = self.list(false).await?;
        Ok(configs
            .into_iter()
            .filter(|c| c.updated_at.is_some_and(|at| at >= since))
            .collect())
    }

    async fn update(&self, mut config: McpConfig, created_by: &str) -> StoreResult<ConfigVersion> {
        check_component(&config.tenant, "tenant")?;
        check_component(&config.name, "config name")?;
        let _guard = self.write_lock.lock().await;

        let mut meta = self.read_meta(&config.tenant, &config.name).await?;
        let existing = self.load_config(&config.tenant, &config.name).await?;
        config.created_at = existing.created_at;
        config.updated_at = Some(Utc::now());
        config.deleted_at = None;
        self.append_version(&config, &mut meta, created_by).await
    }

    async fn delete(&self, tenant: &str, name: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut meta = self.read_meta(tenant, name).await?;
        meta.deleted_at = Some(Utc::now());
        write_json(&self.meta_path(tenant, name), &meta).await
    }

    async fn list_versions(&self, tenant: &str, name: &str) -> StoreResult<Vec<ConfigVersion>> {
        let meta = self.read_meta(tenant, name).await?;
        let mut versions = Vec::with_capacity(meta.versions.len());
        for v in &meta.versions {
            let yaml =
                tokio::fs::read_to_string(self.version_path(tenant, name, v.version)).await?;
            versions.push(ConfigVersion {
                tenant: tenant.to_string(),
                name: name.to_string(),
                version: v.version,
                created_at: v.created_at,
                created_by: v.created_by.clone(),
                is_active: v.is_active,
                yaml,
                hash: v.hash.clone(),
            });
        }
        Ok(versions)
    }

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: u64,
    ) -> StoreResult<ConfigVersion> {
        self.list_versions(tenant, name)
            .await?
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
        let _guard = self.write_lock.lock().await;
        let mut meta = self.read_meta(tenant, name).await?;
        if !meta.versions.iter().any(|v| v.version == version) {
            return Err(StoreError::not_found(format!(
                "version {version} of '{tenant}/{name}'"
            )));
        }
        let yaml = tokio::fs::read_to_string(self.version_path(tenant, name, version)).await?;
        for v in &mut meta.versions {
            v.is_active = v.version == version;
        }
        // The live file follows the activated version.
        write_atomic(&self.config_path(tenant, name), yaml.as_bytes()).await?;
        write_json(&self.meta_path(tenant, name), &meta).await?;
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
        check_component(tenant, "tenant")?;
        let _guard = self.write_lock.lock().await;
        let path = self.tool_status_path(tenant);
        let mut file: ToolStatusFile = read_json(&path).await?.unwrap_or_default();

        let old = file
            .overrides
            .iter()
            .find(|o| o.server == server && o.tool == tool)
            .map(|o| o.enabled);
        let entry = ToolStatusOverride {
            tenant: tenant.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            enabled,
            updated_at: Utc::now(),
        };
        file.overrides
            .retain(|o| !(o.server == server && o.tool == tool));
        file.overrides.push(entry.clone());
        file.history.push(ToolStatusHistory {
            tenant: tenant.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            old,
            new: enabled,
            user_id: user_id.to_string(),
            reason,
            at: entry.updated_at,
        });
        write_json(&path, &file).await?;
        Ok(entry)
    }

    async fn tool_overrides(&self, tenant: &str) -> StoreResult<Vec<ToolStatusOverride>> {
        let file: ToolStatusFile = read_json(&self.tool_status_path(tenant))
            .await?
            .unwrap_or_default();
        Ok(file.overrides)
    }

    async fn tool_status_history(&self, tenant: &str) -> StoreResult<Vec<ToolStatusHistory>> {
        let file: ToolStatusFile = read_json(&self.tool_status_path(tenant))
            .await?
            .unwrap_or_default();
        Ok(file.history)
    }

    async fn save_capabilities(
        &self,
        tenant: &str,
        server: &str,
        info: CapabilitiesInfo,
    ) -> StoreResult<()> {
        check_component(tenant, "tenant")?;
        check_component(server, "server")?;
        write_json(&self.capabilities_path(tenant, server), &info).await
    }

    async fn get_capabilities(
        &self,
        tenant: &str,
        server: &str,
    ) -> StoreResult<Option<CapabilitiesInfo>> {
        read_json(&self.capabilities_path(tenant, server)).await
    }

    async fn record_sync(&self, entry: SyncHistory) -> StoreResult<()> {
        check_component(&entry.tenant, "tenant")?;
        write_json(&self.sync_path(&entry.tenant, &entry.sync_id), &entry).await
    }

    async fn list_sync_history(&self, tenant: &str, server: &str) -> StoreResult<Vec<SyncHistory>> {
        let dir = self.root.join(tenant).join(".meta").join("sync");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut history = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(record) = read_json::<SyncHistory>(&entry.path()).await? {
                if record.server == server {
                    history.push(record);
                }
            }
        }
        history.sort_by_key(|s| s.started_at);
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tenant: &str, name: &str) -> McpConfig {
        McpConfig {
            name: name.to_string(),
            tenant: tenant.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_update_listing_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();

        store.create(config("t", "a"), "op").await.unwrap();
        let v2 = store.update(config("t", "a"), "op").await.unwrap();
        assert_eq!(v2.version, 2);

        let configs = store.list(false).await.unwrap();
        assert_eq!(configs.len(), 1);

        let versions = store.list_versions("t", "a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[1].is_active);
        assert_eq!(versions[1].hash, hash_blob(&versions[1].yaml));
    }

    #[tokio::test]
    async fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.create(config("t", "a"), "op").await.unwrap();
            store.delete("t", "a").await.unwrap();
        }
        let store = DiskStore::open(dir.path()).await.unwrap();
        assert!(store.get("t", "a").await.is_err());
        assert_eq!(store.list(true).await.unwrap().len(), 1);
        assert_eq!(store.list_versions("t", "a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_active_version_restores_old_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();

        let mut first = config("t", "a");
        first.servers.push(crate::model::ServerSpec {
            name: "first".to_string(),
            description: None,
            allowed_tools: vec![],
            config: Default::default(),
        });
        store.create(first, "op").await.unwrap();
        store.update(config("t", "a"), "op").await.unwrap();

        let yaml = store.set_active_version("t", "a", 1).await.unwrap();
        assert!(yaml.contains("first"));
        assert_eq!(store.get("t", "a").await.unwrap().servers.len(), 1);
    }

    #[tokio::test]
    async fn rejects_path_traversal_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let err = store
            .create(config("../evil", "a"), "op")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn unicode_tenant_names_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.create(config("团队", "a"), "op").await.unwrap();
        assert_eq!(store.get("团队", "a").await.unwrap().tenant, "团队");
    }

    #[tokio::test]
    async fn tool_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store
            .set_tool_status("t", "srv", "ping", false, "op", None)
            .await
            .unwrap();
        let overrides = store.tool_overrides("t").await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert!(!overrides[0].enabled);
        assert_eq!(store.tool_status_history("t").await.unwrap().len(), 1);
    }
}
