//! # omnigate-config
//!
//! The gateway's configuration plane: the typed config tree and its YAML
//! wire form, whole-universe validation, the versioned tenant-scoped
//! store, and the notifier bus that fans config changes out to running
//! replicas.

pub mod model;
pub mod notifier;
pub mod store;
pub mod validate;

pub use model::{
    ArgPosition, CapabilitiesInfo, CorsSpec, McpConfig, McpServerSpec, McpServerType, RouterSpec,
    ServerSpec, StartupPolicy, SyncHistory, SyncStatus, Tenant, ToolArg, ToolSpec,
    ToolStatusHistory, ToolStatusOverride,
};
pub use notifier::{
    ConfigEvent, ConfigEventKind, FileNotifier, Notifier, NotifierError, RedisNotifier,
    SignalNotifier,
};
pub use store::{ConfigStore, ConfigVersion, DiskStore, MemoryStore, StoreError};
pub use validate::{validate_universe, ValidationError};

/// Environment variable naming the disk-store root.
pub const ENV_CONFIG_DIR: &str = "CONFIG_DIR";
/// Environment variable naming the PID file used by the signal notifier.
pub const ENV_GATEWAY_PID: &str = "GATEWAY_PID";
/// Environment variable with the redis connection URL.
pub const ENV_REDIS_URL: &str = "REDIS_URL";
