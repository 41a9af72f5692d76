//! Pooling for on-demand transports.
//!
//! Backends with the on-demand policy are brought up on first use and
//! kept warm for subsequent calls; a maintenance sweep stops transports
//! that sit idle past the eviction horizon (5 minutes by default).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::OutboundTransport;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportPoolConfig {
    /// Idle time after which a pooled transport is stopped and dropped
    pub idle_timeout: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
}

impl Default for TransportPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PoolEntry {
    transport: Arc<dyn OutboundTransport>,
    last_used: Mutex<Instant>,
}

/// Keyed pool of shared transports.
///
/// One transport per key; callers clone the `Arc` and drive requests
/// concurrently where the transport supports it.
pub struct TransportPool {
    config: TransportPoolConfig,
    entries: DashMap<String, PoolEntry>,
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("size", &self.entries.len())
            .finish()
    }
}

impl TransportPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: TransportPoolConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Fetch the transport for `key`, creating it with `make` on a miss.
    ///
    /// The factory only constructs; starting remains the caller's job so
    /// the start can run under the caller's deadline and template context.
    pub fn get_or_create(
        &self,
        key: &str,
        make: impl FnOnce() -> Arc<dyn OutboundTransport>,
    ) -> Arc<dyn OutboundTransport> {
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key, "pooling new on-demand transport");
            PoolEntry {
                transport: make(),
                last_used: Mutex::new(Instant::now()),
            }
        });
        *entry.last_used.lock() = Instant::now();
        Arc::clone(&entry.transport)
    }

    /// Drop a specific entry, stopping its transport in the background.
    pub fn evict(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            info!(key, "evicting pooled transport");
            tokio::spawn(async move {
                let _ = entry.transport.stop().await;
            });
        }
    }

    /// Stop everything; used on shutdown and reload-removal.
    pub async fn drain(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                let _ = entry.transport.stop().await;
            }
        }
    }

    /// Number of pooled transports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self) {
        let horizon = self.config.idle_timeout;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.last_used.lock().elapsed() > horizon)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.evict(&key);
        }
    }

    /// Spawn the periodic idle sweep; runs for the pool's lifetime.
    pub fn start_maintenance(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.sweep();
            }
        });
    }
}
