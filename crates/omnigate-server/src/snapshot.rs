//! The compiled routing table.
//!
//! A snapshot is built off the hot path from the full set of active
//! configs, then published atomically (`arc-swap`). Requests resolve
//! their route by longest-prefix match and hold an `Arc` to the snapshot
//! they started with, so a reload never changes the world under an
//! in-flight request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};
use omnigate_config::validate::{normalize_prefix, validate_universe};
use omnigate_config::{
    CorsSpec, McpConfig, McpServerSpec, ServerSpec, Tenant, ToolSpec, ToolStatusOverride,
};
use omnigate_protocol::types::{Prompt, Resource, ResourceTemplate, Tool};
use omnigate_template::Template;

/// One tool, compiled: templates parsed, schema built.
pub struct CompiledTool {
    /// The underlying definition
    pub spec: ToolSpec,
    /// Parsed endpoint template (path params already normalized)
    pub endpoint: Template,
    /// Parsed header templates
    pub headers: Vec<(String, Template)>,
    /// Parsed request-body template, if declared
    pub request_body: Option<Template>,
    /// Parsed response-shaping template, if declared
    pub response_body: Option<Template>,
    /// Compiled argument schema, when `input_schema` is present
    pub input_schema: Option<JSONSchema>,
}

impl std::fmt::Debug for CompiledTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTool")
            .field("name", &self.spec.name)
            .finish()
    }
}

impl CompiledTool {
    fn compile(spec: &ToolSpec) -> GatewayResult<Self> {
        let endpoint = Template::parse(&spec.normalized_endpoint())
            .map_err(|e| GatewayError::Internal(format!("tool '{}': {e}", spec.name)))?;
        let mut headers = Vec::with_capacity(spec.headers.len());
        for (name, value) in &spec.headers {
            let template = Template::parse(value)
                .map_err(|e| GatewayError::Internal(format!("tool '{}': {e}", spec.name)))?;
            headers.push((name.clone(), template));
        }
        let request_body = spec
            .request_body
            .as_deref()
            .map(Template::parse)
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("tool '{}': {e}", spec.name)))?;
        let response_body = spec
            .response_body
            .as_deref()
            .map(Template::parse)
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("tool '{}': {e}", spec.name)))?;

        let input_schema = spec.input_schema.as_ref().and_then(|schema| {
            match JSONSchema::options()
                .with_draft(jsonschema::Draft::Draft7)
                .compile(schema)
            {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!(tool = %spec.name, error = %e, "uncompilable input schema ignored");
                    None
                }
            }
        });

        Ok(Self {
            spec: spec.clone(),
            endpoint,
            headers,
            request_body,
            response_body,
            input_schema,
        })
    }

    /// The tool as advertised to MCP clients.
    #[must_use]
    pub fn advertised(&self) -> Tool {
        Tool {
            name: self.spec.name.clone(),
            description: self.spec.effective_description(),
            input_schema: self
                .spec
                .input_schema
                .clone()
                .unwrap_or_else(|| generate_input_schema(&self.spec)),
        }
    }
}

/// Generate a JSON Schema from the declared arguments.
fn generate_input_schema(spec: &ToolSpec) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for arg in &spec.args {
        let mut prop = serde_json::Map::new();
        prop.insert("type".to_string(), Value::String(arg.arg_type.clone()));
        if let Some(desc) = &arg.description {
            prop.insert("description".to_string(), Value::String(desc.clone()));
        }
        if let Some(items) = &arg.items {
            prop.insert("items".to_string(), json!({"type": items.item_type}));
        }
        if let Some(default) = &arg.default {
            prop.insert("default".to_string(), default.clone());
        }
        properties.insert(arg.name.clone(), Value::Object(prop));
        if arg.required {
            required.push(Value::String(arg.name.clone()));
        }
    }
    let mut schema = serde_json::Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    Value::Object(schema)
}

/// One compiled route: a prefix bound to a synthetic server.
pub struct CompiledRoute {
    /// Normalized URL prefix
    pub prefix: String,
    /// SSE endpoint suffix (default `/sse`)
    pub sse_suffix: String,
    /// Owning tenant
    pub tenant: String,
    /// The synthetic server definition
    pub server: ServerSpec,
    /// CORS policy, if configured
    pub cors: Option<CorsSpec>,
    /// Tools exposed on this route, compiled, keyed by name
    pub tools: HashMap<String, Arc<CompiledTool>>,
    /// Prompts exposed on this route
    pub prompts: Vec<Prompt>,
    /// Resources exposed on this route
    pub resources: Vec<Resource>,
    /// Resource templates exposed on this route
    pub resource_templates: Vec<ResourceTemplate>,
    /// Outbound backends declared by the owning config
    pub backends: Vec<McpServerSpec>,
    /// Tools masked off by status overrides
    pub disabled_tools: HashSet<String>,
    /// Upstream tools masked off, keyed by backend name
    pub disabled_upstream: HashMap<String, HashSet<String>>,
}

impl std::fmt::Debug for CompiledRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRoute")
            .field("prefix", &self.prefix)
            .field("tenant", &self.tenant)
            .field("server", &self.server.name)
            .finish()
    }
}

impl CompiledRoute {
    /// A tool on this route, provided it is allowed and enabled.
    pub fn tool(&self, name: &str) -> GatewayResult<Arc<CompiledTool>> {
        let Some(tool) = self.tools.get(name) else {
            return Err(GatewayError::ToolNotFound(name.to_string()));
        };
        if self.disabled_tools.contains(name) {
            return Err(GatewayError::ToolDisabled(name.to_string()));
        }
        Ok(Arc::clone(tool))
    }

    /// Stable identity for a backend owned by this route's config.
    #[must_use]
    pub fn backend_key(&self, backend: &McpServerSpec) -> String {
        backend_key(&self.tenant, &backend.name)
    }
}

/// Stable pool/registry key for a backend.
#[must_use]
pub fn backend_key(tenant: &str, backend_name: &str) -> String {
    format!("{tenant}/{backend_name}")
}

/// Immutable routing state, swapped atomically on reload.
pub struct RoutingSnapshot {
    /// Monotonic reload generation
    pub generation: u64,
    /// Routes sorted by descending prefix segment depth
    routes: Vec<Arc<CompiledRoute>>,
}

impl std::fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("generation", &self.generation)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl RoutingSnapshot {
    /// An empty snapshot, used before the first reload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            generation: 0,
            routes: Vec::new(),
        }
    }

    /// Validate the universe and compile a new snapshot.
    pub fn build(
        generation: u64,
        configs: &[McpConfig],
        tenants: &[Tenant],
        overrides: &[ToolStatusOverride],
    ) -> GatewayResult<Self> {
        validate_universe(configs, tenants).map_err(GatewayError::Validation)?;

        let mut disabled: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for o in overrides.iter().filter(|o| !o.enabled) {
            disabled
                .entry((o.tenant.clone(), o.server.clone()))
                .or_default()
                .insert(o.tool.clone());
        }

        let mut routes = Vec::new();
        for config in configs.iter().filter(|c| c.deleted_at.is_none()) {
            // Compile each tool once per config, shared across its routes.
            let mut compiled_tools: HashMap<String, Arc<CompiledTool>> = HashMap::new();
            for tool in &config.tools {
                compiled_tools.insert(tool.name.clone(), Arc::new(CompiledTool::compile(tool)?));
            }

            for router in &config.routers {
                let Some(server) = config.server(&router.server) else {
                    // validate_universe already rejected this; defensive skip.
                    continue;
                };
                let tools: HashMap<String, Arc<CompiledTool>> = server
                    .allowed_tools
                    .iter()
                    .filter_map(|name| {
                        compiled_tools
                            .get(name)
                            .map(|t| (name.clone(), Arc::clone(t)))
                    })
                    .collect();
                let disabled_tools = disabled
                    .get(&(config.tenant.clone(), server.name.clone()))
                    .cloned()
                    .unwrap_or_default();
                let disabled_upstream: HashMap<String, HashSet<String>> = config
                    .mcp_servers
                    .iter()
                    .filter_map(|backend| {
                        disabled
                            .get(&(config.tenant.clone(), backend.name.clone()))
                            .map(|set| (backend.name.clone(), set.clone()))
                    })
                    .collect();

                routes.push(Arc::new(CompiledRoute {
                    prefix: normalize_prefix(&router.prefix),
                    sse_suffix: router
                        .sse_prefix
                        .clone()
                        .unwrap_or_else(|| "/sse".to_string()),
                    tenant: config.tenant.clone(),
                    server: server.clone(),
                    cors: router.cors.clone(),
                    tools,
                    prompts: config.prompts.clone(),
                    resources: config.resources.clone(),
                    resource_templates: config.resource_templates.clone(),
                    backends: config.mcp_servers.clone(),
                    disabled_tools,
                    disabled_upstream,
                }));
            }
        }

        // Longest prefix first so matching can take the first hit.
        routes.sort_by(|a, b| {
            b.prefix
                .matches('/')
                .count()
                .cmp(&a.prefix.matches('/').count())
                .then_with(|| b.prefix.len().cmp(&a.prefix.len()))
        });

        Ok(Self { generation, routes })
    }

    /// Longest-prefix match of a request path onto a route.
    ///
    /// Returns the route and the path remainder after the prefix.
    #[must_use]
    pub fn match_path<'a>(&self, path: &'a str) -> Option<(Arc<CompiledRoute>, &'a str)> {
        let path = if path.is_empty() { "/" } else { path };
        for route in &self.routes {
            if let Some(rest) = strip_prefix_segmented(path, &route.prefix) {
                return Some((Arc::clone(route), rest));
            }
        }
        None
    }

    /// All routes in match order.
    #[must_use]
    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    /// Every backend referenced by any route, keyed for the registry.
    #[must_use]
    pub fn backends(&self) -> HashMap<String, McpServerSpec> {
        let mut backends = HashMap::new();
        for route in &self.routes {
            for backend in &route.backends {
                backends.insert(backend_key(&route.tenant, &backend.name), backend.clone());
            }
        }
        backends
    }
}

/// `/t/x` matches prefix `/t` with rest `/x`; `/tother` does not.
fn strip_prefix_segmented<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') {
        Some(rest)
    } else {
        None
    }
}
