//! Shared gateway state: the published snapshot and everything that
//! survives across requests.
//!
//! The snapshot is immutable once published; `reload` builds a new one
//! off-path and swaps a single pointer, so in-flight requests keep the
//! world they started with. Reloads are serialized on one mutex and each
//! gets a monotonically increasing generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::invoke::ToolInvoker;
use crate::session::{SessionRegistry, SessionRegistryConfig};
use crate::snapshot::{backend_key, RoutingSnapshot};
use omnigate_config::{
    CapabilitiesInfo, ConfigStore, McpServerSpec, McpServerType, Notifier, StartupPolicy,
    SyncHistory, SyncStatus, ToolStatusOverride,
};
use omnigate_transport::{
    fetch_capabilities, OutboundTransport, SseTransport, SseTransportConfig, StdioTransport,
    StdioTransportConfig, StreamableTransport, StreamableTransportConfig, TransportPool,
    TransportPoolConfig,
};
use omnigate_template::RenderContext;

/// Gateway-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Session registry configuration
    pub sessions: SessionRegistryConfig,
    /// On-demand transport pool configuration
    pub pool: TransportPoolConfig,
    /// Per-kind capability fetch timeout
    pub capability_timeout: Duration,
    /// How long shutdown waits for transports and the store to flush
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sessions: SessionRegistryConfig::default(),
            pool: TransportPoolConfig::default(),
            capability_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Long-lived gateway state shared by every request task.
pub struct GatewayState {
    store: Arc<dyn ConfigStore>,
    snapshot: ArcSwap<RoutingSnapshot>,
    /// Live client sessions
    pub sessions: Arc<SessionRegistry>,
    /// Synthesized-tool executor
    pub invoker: ToolInvoker,
    pool: Arc<TransportPool>,
    on_start: DashMap<String, Arc<dyn OutboundTransport>>,
    capabilities: Arc<DashMap<String, CapabilitiesInfo>>,
    reload_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    config: GatewayConfig,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl GatewayState {
    /// Create state around a store; the snapshot starts empty until the
    /// first [`GatewayState::reload`].
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::empty()),
            sessions: Arc::new(SessionRegistry::new(config.sessions.clone())),
            invoker: ToolInvoker::new(),
            pool: Arc::new(TransportPool::new(config.pool.clone())),
            on_start: DashMap::new(),
            capabilities: Arc::new(DashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            config,
        })
    }

    /// The store this gateway reads config from.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Grab the current snapshot. Readers clone the `Arc` and never block.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// Start background upkeep: session reaper and pool sweep.
    pub fn start_background(self: &Arc<Self>) {
        self.sessions.start_reaper();
        self.pool.start_maintenance();
    }

    /// Fetch, validate, compile and publish a fresh snapshot, then
    /// reconcile on-start transports against it.
    pub async fn reload(&self) -> GatewayResult<u64> {
        let _guard = self.reload_lock.lock().await;

        let tenants = self.store.list_tenants().await?;
        let configs = self.store.list(false).await?;
        let mut overrides: Vec<ToolStatusOverride> = Vec::new();
        for tenant in &tenants {
            overrides.extend(self.store.tool_overrides(&tenant.name).await?);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next = RoutingSnapshot::build(generation, &configs, &tenants, &overrides)?;

        let previous = self.snapshot.load_full();
        let old_backends = previous.backends();
        let new_backends = next.backends();

        self.snapshot.store(Arc::new(next));
        info!(generation, routes = self.snapshot().routes().len(), "routing snapshot published");

        self.reconcile_backends(&old_backends, &new_backends);
        Ok(generation)
    }

    fn reconcile_backends(
        &self,
        old: &HashMap<String, McpServerSpec>,
        new: &HashMap<String, McpServerSpec>,
    ) {
        // Removed or redefined backends: stop the old instance. In-flight
        // requests hold their own Arc and drain before the stop lands.
        for (key, old_spec) in old {
            let changed = new.get(key).map_or(true, |spec| spec != old_spec);
            if changed {
                self.pool.evict(key);
                if let Some((_, transport)) = self.on_start.remove(key) {
                    info!(backend = %key, "stopping removed backend");
                    tokio::spawn(async move {
                        let _ = transport.stop().await;
                    });
                }
            }
        }

        // New or redefined on-start backends come up in the background.
        for (key, spec) in new {
            if spec.policy != StartupPolicy::OnStart {
                continue;
            }
            let fresh = old.get(key).map_or(true, |old_spec| old_spec != spec);
            if !fresh && self.on_start.contains_key(key) {
                continue;
            }
            let tenant = key.split('/').next().unwrap_or_default().to_string();
            let transport = make_transport(spec);
            self.on_start.insert(key.clone(), Arc::clone(&transport));

            let spec = spec.clone();
            let key = key.clone();
            let store = Arc::clone(&self.store);
            let capabilities = Arc::clone(&self.capabilities);
            let per_kind_timeout = self.config.capability_timeout;
            tokio::spawn(async move {
                sync_backend(
                    store,
                    capabilities,
                    key,
                    tenant,
                    spec,
                    transport,
                    per_kind_timeout,
                )
                .await;
            });
        }
    }

    /// Resolve the transport for a backend according to its policy,
    /// starting it if needed.
    pub async fn transport_for(
        &self,
        tenant: &str,
        spec: &McpServerSpec,
    ) -> GatewayResult<Arc<dyn OutboundTransport>> {
        let key = backend_key(tenant, &spec.name);
        let transport = match spec.policy {
            StartupPolicy::OnStart => match self.on_start.get(&key) {
                Some(entry) => Arc::clone(entry.value()),
                None => {
                    // Reload raced us; fall back to a pooled instance.
                    self.pool.get_or_create(&key, || make_transport(spec))
                }
            },
            StartupPolicy::OnDemand => self.pool.get_or_create(&key, || make_transport(spec)),
        };
        if !transport.is_running() {
            transport.start(&RenderContext::default()).await?;
        }
        Ok(transport)
    }

    /// Cached capability sync result for a backend, if any.
    #[must_use]
    pub fn cached_capabilities(&self, tenant: &str, backend: &str) -> Option<CapabilitiesInfo> {
        self.capabilities
            .get(&backend_key(tenant, backend))
            .map(|entry| entry.value().clone())
    }

    /// Subscribe to a notifier and reload on every event.
    ///
    /// Events carry hashes receivers can compare, but a full reload is
    /// already idempotent and cheap at gateway scale, so every event maps
    /// to one serialized reload.
    pub fn watch_notifier(self: &Arc<Self>, notifier: Arc<dyn Notifier>) {
        let state = Arc::clone(self);
        let mut rx = notifier.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        info!(kind = ?event.kind, "config event received");
                        if let Err(e) = state.reload().await {
                            error!(error = %e, "reload after config event failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notifier lagged, forcing reload");
                        if let Err(e) = state.reload().await {
                            error!(error = %e, "catch-up reload failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Graceful shutdown: close sessions, stop transports, let the store
    /// flush within the configured window.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.sessions.close_all();

        let stop_all = async {
            let keys: Vec<String> = self.on_start.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, transport)) = self.on_start.remove(&key) {
                    let _ = transport.stop().await;
                }
            }
            self.pool.drain().await;
        };
        if tokio::time::timeout(self.config.shutdown_timeout, stop_all)
            .await
            .is_err()
        {
            warn!("transport drain exceeded the shutdown window");
        }
    }
}

/// Construct (but do not start) a transport for a backend definition.
fn make_transport(spec: &McpServerSpec) -> Arc<dyn OutboundTransport> {
    match spec.server_type {
        McpServerType::Stdio => Arc::new(StdioTransport::new(StdioTransportConfig {
            command: spec.command.clone().unwrap_or_default(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            ..Default::default()
        })),
        McpServerType::Sse => Arc::new(SseTransport::new(SseTransportConfig {
            url: spec.url.clone().unwrap_or_default(),
            headers: spec.headers.clone(),
            ..Default::default()
        })),
        McpServerType::StreamableHttp => {
            Arc::new(StreamableTransport::new(StreamableTransportConfig {
                url: spec.url.clone().unwrap_or_default(),
                headers: spec.headers.clone(),
                ..Default::default()
            }))
        }
    }
}

/// Start a backend and sync its capabilities, recording progress.
#[allow(clippy::too_many_arguments)]
async fn sync_backend(
    store: Arc<dyn ConfigStore>,
    capabilities: Arc<DashMap<String, CapabilitiesInfo>>,
    key: String,
    tenant: String,
    spec: McpServerSpec,
    transport: Arc<dyn OutboundTransport>,
    per_kind_timeout: Duration,
) {
    let sync_id = Uuid::new_v4().simple().to_string();
    let started_at = Utc::now();
    let mut entry = SyncHistory {
        sync_id,
        tenant: tenant.clone(),
        server: spec.name.clone(),
        status: SyncStatus::Running,
        started_at,
        completed_at: None,
        progress: 0,
        sync_types: vec![
            "tools".to_string(),
            "prompts".to_string(),
            "resources".to_string(),
            "resource_templates".to_string(),
        ],
        summary: json!({}),
        error: None,
    };
    let _ = store.record_sync(entry.clone()).await;

    if let Err(e) = transport.start(&RenderContext::default()).await {
        error!(backend = %key, error = %e, "backend start failed");
        entry.status = SyncStatus::Failed;
        entry.completed_at = Some(Utc::now());
        entry.error = Some(e.to_string());
        let _ = store.record_sync(entry).await;
        return;
    }
    entry.progress = 25;
    let _ = store.record_sync(entry.clone()).await;

    let outcome = fetch_capabilities(transport.as_ref(), per_kind_timeout).await;
    let info = CapabilitiesInfo {
        tools: outcome.tools.clone().unwrap_or_default(),
        prompts: outcome.prompts.clone().unwrap_or_default(),
        resources: outcome.resources.clone().unwrap_or_default(),
        resource_templates: outcome.resource_templates.clone().unwrap_or_default(),
        last_synced: Some(Utc::now()),
        server_info: transport.server_info(),
    };
    let _ = store.save_capabilities(&tenant, &spec.name, info.clone()).await;
    capabilities.insert(key.clone(), info);

    entry.status = if outcome.is_total_failure() {
        SyncStatus::Failed
    } else if outcome.is_partial() {
        SyncStatus::Partial
    } else {
        SyncStatus::Success
    };
    entry.progress = 100;
    entry.completed_at = Some(Utc::now());
    entry.summary = json!({
        "tools": outcome.tools.map_or(-1i64, |t| t.len() as i64),
        "prompts": outcome.prompts.map_or(-1i64, |p| p.len() as i64),
        "resources": outcome.resources.map_or(-1i64, |r| r.len() as i64),
        "resource_templates": outcome.resource_templates.map_or(-1i64, |r| r.len() as i64),
        "errors": outcome
            .errors
            .iter()
            .map(|(kind, message)| json!({"kind": kind.as_str(), "message": message}))
            .collect::<Vec<_>>(),
    });
    if !outcome.errors.is_empty() {
        entry.error = Some(
            outcome
                .errors
                .iter()
                .map(|(kind, message)| format!("{}: {message}", kind.as_str()))
                .collect::<Vec<_>>()
                .join("; "),
        );
    }
    info!(backend = %key, status = ?entry.status, "capability sync finished");
    let _ = store.record_sync(entry).await;
}

impl GatewayState {
    /// Current reload generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnigate_config::{ConfigStore, McpConfig, MemoryStore, RouterSpec, ServerSpec, Tenant};
    use std::collections::BTreeMap;

    fn sample_config(prefix: &str) -> McpConfig {
        McpConfig {
            name: "c".to_string(),
            tenant: "t".to_string(),
            servers: vec![ServerSpec {
                name: "srv".to_string(),
                description: None,
                allowed_tools: vec![],
                config: BTreeMap::new(),
            }],
            routers: vec![RouterSpec {
                server: "srv".to_string(),
                prefix: prefix.to_string(),
                cors: None,
                sse_prefix: None,
            }],
            ..Default::default()
        }
    }

    async fn store_with(prefix: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put_tenant(Tenant {
                name: "t".to_string(),
                prefix: "/t".to_string(),
                active: true,
            })
            .await
            .unwrap();
        store.create(sample_config(prefix), "op").await.unwrap();
        store
    }

    #[tokio::test]
    async fn reload_publishes_increasing_generations() {
        let store = store_with("/t/c").await;
        let state = GatewayState::new(store, GatewayConfig::default());

        let g1 = state.reload().await.unwrap();
        let g2 = state.reload().await.unwrap();
        assert!(g2 > g1);
        assert_eq!(state.generation(), g2);
        assert!(state.snapshot().match_path("/t/c").is_some());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let store = store_with("/t/c").await;
        let state = GatewayState::new(Arc::clone(&store) as Arc<dyn ConfigStore>, GatewayConfig::default());
        state.reload().await.unwrap();
        let before = state.generation();

        // Break the universe: a prefix outside the tenant.
        store
            .update(sample_config("/elsewhere"), "op")
            .await
            .unwrap();
        assert!(state.reload().await.is_err());

        // Old routing still serves.
        assert_eq!(state.generation(), before);
        assert!(state.snapshot().match_path("/t/c").is_some());
    }

    #[tokio::test]
    async fn in_flight_snapshot_survives_reload() {
        let store = store_with("/t/c").await;
        let state = GatewayState::new(Arc::clone(&store) as Arc<dyn ConfigStore>, GatewayConfig::default());
        state.reload().await.unwrap();

        let held = state.snapshot();
        store.update(sample_config("/t/other"), "op").await.unwrap();
        state.reload().await.unwrap();

        // The held snapshot still routes the old prefix; the new one doesn't.
        assert!(held.match_path("/t/c").is_some());
        assert!(state.snapshot().match_path("/t/c").is_none());
        assert!(state.snapshot().match_path("/t/other").is_some());
    }
}
