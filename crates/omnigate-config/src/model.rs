//! The typed configuration tree and its persisted YAML form.
//!
//! Wire keys are camelCase (`mcpServers`, `allowedTools`, `requestBody`);
//! Rust fields stay snake_case. A config serializes byte-stably enough
//! that its SHA-256 over the stored YAML blob identifies a version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use omnigate_core::RetryPolicy;
use omnigate_protocol::types::{Prompt, Resource, ResourceTemplate};

/// Isolation unit owning a URL path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant name
    pub name: String,
    /// Unique path prefix with a leading `/`
    pub prefix: String,
    /// Inactive tenants reject new configs and routing
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Unit of configuration versioning, scoped to `(tenant, name)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    /// Config name, unique within the tenant
    pub name: String,
    /// Owning tenant name
    pub tenant: String,
    /// Creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Outbound MCP backends
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerSpec>,
    /// Synthetic servers exposing templated HTTP tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerSpec>,
    /// HTTP-synthesized tool definitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// URL prefix bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routers: Vec<RouterSpec>,
    /// Prompts served by synthetic servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
    /// Resources served by synthetic servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// Resource templates served by synthetic servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_templates: Vec<ResourceTemplate>,
}

/// Outbound MCP backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum McpServerType {
    /// Child process speaking newline-delimited JSON-RPC
    Stdio,
    /// HTTP + server-sent events
    Sse,
    /// Single-endpoint streamable HTTP
    StreamableHttp,
}

/// When an outbound transport is brought up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupPolicy {
    /// Created per invocation and pooled
    #[default]
    OnDemand,
    /// Created at config load, torn down on removal
    OnStart,
}

/// One outbound MCP backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    /// Backend name, unique within the config
    pub name: String,
    /// Transport kind
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    /// Command to spawn (stdio only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment (stdio only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Endpoint URL (sse / streamable-http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers (sse / streamable-http); values may be templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Startup policy
    #[serde(default)]
    pub policy: StartupPolicy,
}

/// Synthetic server: exposes a subset of the config's tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Server name, referenced by routers
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tools this server exposes, by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Key/value map consumed by tool templates as `.Config.*`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Where a tool argument is placed in the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgPosition {
    /// Substituted into the endpoint path
    Path,
    /// Appended as a URL query parameter
    Query,
    /// Sent as an HTTP header
    Header,
    /// Rendered into the request body
    Body,
}

/// Declared element type for array arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgItems {
    /// Element type name (`string`, `number`, ...)
    #[serde(rename = "type")]
    pub item_type: String,
}

/// One declared tool argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolArg {
    /// Argument name
    pub name: String,
    /// Request position
    pub position: ArgPosition,
    /// Declared type: `string`, `number`, `integer`, `boolean`, `array`, `object`
    #[serde(rename = "type", default = "default_arg_type")]
    pub arg_type: String,
    /// Whether the argument must be supplied
    #[serde(default)]
    pub required: bool,
    /// Default applied when an optional argument is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Element type for `array` arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ArgItems>,
}

fn default_arg_type() -> String {
    "string".to_string()
}

/// One HTTP-synthesized tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Tool name, unique within the config
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// OpenAPI-style summary; used when `description` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// HTTP method
    pub method: String,
    /// Endpoint template; `{param}` is normalized to `{{.Args.param}}`
    pub endpoint: String,
    /// Header templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Declared arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ToolArg>,
    /// Request-body template (rendered when body args exist)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Response-shaping template; default passes the body through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Optional JSON Schema overriding the generated argument schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Per-call deadline in milliseconds (default 30 000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry policy for idempotent methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ToolSpec {
    /// Effective description: first non-empty of (description, summary).
    #[must_use]
    pub fn effective_description(&self) -> Option<String> {
        self.description
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.summary.as_deref().filter(|s| !s.is_empty()))
            .map(str::to_string)
    }

    /// Endpoint with `{param}` path placeholders rewritten to template
    /// actions, so the data plane renders a single syntax.
    #[must_use]
    pub fn normalized_endpoint(&self) -> String {
        normalize_path_params(&self.endpoint)
    }

    /// Declared argument lookup with the position precedence used at
    /// invocation time: path > query > header > body.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&ToolArg> {
        let rank = |p: ArgPosition| match p {
            ArgPosition::Path => 0,
            ArgPosition::Query => 1,
            ArgPosition::Header => 2,
            ArgPosition::Body => 3,
        };
        self.args
            .iter()
            .filter(|a| a.name == name)
            .min_by_key(|a| rank(a.position))
    }
}

/// Rewrite `{param}` spans to `{{.Args.param}}`, leaving `{{...}}` actions
/// untouched.
fn normalize_path_params(endpoint: &str) -> String {
    let mut out = String::with_capacity(endpoint.len());
    let bytes = endpoint.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if bytes.get(i + 1) == Some(&b'{') {
                // Existing action; copy through to its close.
                match endpoint[i..].find("}}") {
                    Some(rel) => {
                        out.push_str(&endpoint[i..i + rel + 2]);
                        i += rel + 2;
                        continue;
                    }
                    None => {
                        out.push_str(&endpoint[i..]);
                        break;
                    }
                }
            }
            if let Some(rel) = endpoint[i..].find('}') {
                let name = &endpoint[i + 1..i + rel];
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
                {
                    out.push_str("{{.Args.");
                    out.push_str(name);
                    out.push_str("}}");
                    i += rel + 1;
                    continue;
                }
            }
        }
        let Some(ch) = endpoint[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// CORS settings attached to a router prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsSpec {
    /// Allowed origins; `*` allows any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_origins: Vec<String>,
    /// Allowed methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_methods: Vec<String>,
    /// Allowed headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_headers: Vec<String>,
    /// Whether credentials are allowed
    #[serde(default)]
    pub allow_credentials: bool,
}

/// Binding of a URL prefix to a server definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// Server name this prefix routes to
    pub server: String,
    /// URL prefix; must live inside the owning tenant's prefix
    pub prefix: String,
    /// Optional CORS policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsSpec>,
    /// Optional override for the SSE endpoint suffix (default `/sse`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_prefix: Option<String>,
}

impl McpConfig {
    /// Parse the persisted YAML form.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to the persisted YAML form.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// SHA-256 over the canonical YAML encoding, hex-encoded.
    ///
    /// Receivers compare hashes to make notifier delivery idempotent.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let yaml = self.to_yaml().unwrap_or_default();
        hash_blob(&yaml)
    }

    /// Find a synthetic server by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Find a tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Find an outbound backend by name.
    #[must_use]
    pub fn mcp_server(&self, name: &str) -> Option<&McpServerSpec> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }
}

/// Hex SHA-256 of a stored blob.
#[must_use]
pub fn hash_blob(blob: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    hex::encode(hasher.finalize())
}

/// A per-tool enable/disable override, masking the upstream flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatusOverride {
    /// Owning tenant
    pub tenant: String,
    /// Server the tool belongs to
    pub server: String,
    /// Tool name
    pub tool: String,
    /// Effective enabled state
    pub enabled: bool,
    /// Last change timestamp
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row for tool-status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatusHistory {
    /// Owning tenant
    pub tenant: String,
    /// Server the tool belongs to
    pub server: String,
    /// Tool name
    pub tool: String,
    /// Previous state (none on first override)
    pub old: Option<bool>,
    /// New state
    pub new: bool,
    /// Operator who made the change
    pub user_id: String,
    /// Free-form reason
    pub reason: Option<String>,
    /// Change timestamp
    pub at: DateTime<Utc>,
}

/// Denormalized cache of the last capability sync for `(tenant, server)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesInfo {
    /// Synced tools
    #[serde(default)]
    pub tools: Vec<omnigate_protocol::types::Tool>,
    /// Synced prompts
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    /// Synced resources
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Synced resource templates
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplate>,
    /// When the last sync completed
    pub last_synced: Option<DateTime<Utc>>,
    /// Upstream server identity, if the handshake succeeded
    pub server_info: Option<omnigate_protocol::types::Implementation>,
}

/// Outcome of a capability sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Queued but not started
    Pending,
    /// In progress
    Running,
    /// All requested kinds synced
    Success,
    /// Nothing synced
    Failed,
    /// Some kinds synced, some failed
    Partial,
}

/// One capability-sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistory {
    /// Unique sync id
    pub sync_id: String,
    /// Owning tenant
    pub tenant: String,
    /// Target server
    pub server: String,
    /// Run status
    pub status: SyncStatus,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress, 0..=100
    pub progress: u8,
    /// Capability kinds requested (`tools`, `prompts`, ...)
    pub sync_types: Vec<String>,
    /// Per-kind outcome summary
    pub summary: Value,
    /// Failure detail, if any
    pub error: Option<String>,
}
