//! Whole-universe config validation.
//!
//! Validation runs over the complete set of active configs because the
//! uniqueness rules (router prefixes) span configs. Errors are aggregated
//! so an operator sees every problem in one pass; each error names the
//! offending config, field path and reason, and is surfaced verbatim by
//! the admin API.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::model::{ArgPosition, McpConfig, McpServerType, Tenant};
use omnigate_template::Template;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    /// `(tenant, name)` of the offending config
    pub config: String,
    /// Dotted/indexed path to the offending field
    pub field_path: String,
    /// What is wrong
    pub reason: String,
    /// The owning tenant's prefix, for prefix-rule failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_prefix: Option<String>,
}

impl ValidationError {
    fn new(config: &McpConfig, field_path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            config: format!("{}/{}", config.tenant, config.name),
            field_path: field_path.into(),
            reason: reason.into(),
            tenant_prefix: None,
        }
    }

    fn with_tenant_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tenant_prefix = Some(prefix.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.config, self.field_path, self.reason)?;
        if let Some(prefix) = &self.tenant_prefix {
            write!(f, " (tenant prefix {prefix})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

const HTTP_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Strip a trailing `/` (except for the root) without touching anything
/// else; prefixes must already carry their leading `/`.
#[must_use]
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether `prefix` equals the tenant prefix or extends it by whole path
/// segments.
#[must_use]
pub fn prefix_contained(prefix: &str, tenant_prefix: &str) -> bool {
    if tenant_prefix == "/" {
        return prefix.starts_with('/');
    }
    prefix == tenant_prefix || prefix.starts_with(&format!("{tenant_prefix}/"))
}

/// Validate a set of configs against the tenant universe.
///
/// Deleted configs are skipped entirely: they neither get validated nor
/// count toward prefix uniqueness.
pub fn validate_universe(
    configs: &[McpConfig],
    tenants: &[Tenant],
) -> Result<(), Vec<ValidationError>> {
    let tenant_by_name: HashMap<&str, &Tenant> =
        tenants.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut errors = Vec::new();
    // prefix -> first claiming config, for the universe-wide uniqueness rule
    let mut claimed_prefixes: HashMap<String, String> = HashMap::new();

    for config in configs.iter().filter(|c| c.deleted_at.is_none()) {
        validate_one(config, &tenant_by_name, &mut claimed_prefixes, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_one(
    config: &McpConfig,
    tenants: &HashMap<&str, &Tenant>,
    claimed_prefixes: &mut HashMap<String, String>,
    errors: &mut Vec<ValidationError>,
) {
    // Rule 1: tenant must be named and known.
    if config.tenant.is_empty() {
        errors.push(ValidationError::new(config, "tenant", "tenant is required"));
        return;
    }
    let Some(tenant) = tenants.get(config.tenant.as_str()) else {
        errors.push(ValidationError::new(
            config,
            "tenant",
            format!("unknown tenant '{}'", config.tenant),
        ));
        return;
    };
    if !tenant.active {
        errors.push(ValidationError::new(
            config,
            "tenant",
            format!("tenant '{}' is inactive", tenant.name),
        ));
    }
    let tenant_prefix = normalize_prefix(&tenant.prefix);

    // Rules 1-3: router prefixes.
    for (i, router) in config.routers.iter().enumerate() {
        let field = format!("routers[{i}].prefix");
        if !router.prefix.starts_with('/') {
            errors.push(ValidationError::new(
                config,
                &field,
                format!("prefix '{}' must start with '/'", router.prefix),
            ));
            continue;
        }
        let prefix = normalize_prefix(&router.prefix);
        if !prefix_contained(&prefix, &tenant_prefix) {
            errors.push(
                ValidationError::new(
                    config,
                    &field,
                    format!("prefix '{prefix}' is outside the tenant prefix"),
                )
                .with_tenant_prefix(&tenant_prefix),
            );
        }
        if let Some(owner) = claimed_prefixes.get(&prefix) {
            errors.push(ValidationError::new(
                config,
                &field,
                format!("prefix '{prefix}' is already routed by config '{owner}'"),
            ));
        } else {
            claimed_prefixes.insert(prefix, format!("{}/{}", config.tenant, config.name));
        }

        if config.server(&router.server).is_none() {
            errors.push(ValidationError::new(
                config,
                format!("routers[{i}].server"),
                format!("unknown server '{}'", router.server),
            ));
        }
    }

    // Rule 4: allowed_tools resolve within the same config.
    for (si, server) in config.servers.iter().enumerate() {
        for (ti, tool_name) in server.allowed_tools.iter().enumerate() {
            if config.tool(tool_name).is_none() {
                errors.push(ValidationError::new(
                    config,
                    format!("servers[{si}].allowedTools[{ti}]"),
                    format!("tool '{tool_name}' is not defined in this config"),
                ));
            }
        }
    }

    // Rule 5: tool definitions.
    let mut seen_tools = HashSet::new();
    for (i, tool) in config.tools.iter().enumerate() {
        if !seen_tools.insert(tool.name.as_str()) {
            errors.push(ValidationError::new(
                config,
                format!("tools[{i}].name"),
                format!("duplicate tool name '{}'", tool.name),
            ));
        }
        let method = tool.method.to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            errors.push(ValidationError::new(
                config,
                format!("tools[{i}].method"),
                format!("'{}' is not a supported HTTP method", tool.method),
            ));
        }
        if let Err(e) = Template::parse(&tool.normalized_endpoint()) {
            errors.push(ValidationError::new(
                config,
                format!("tools[{i}].endpoint"),
                e.to_string(),
            ));
        }
        for (name, value) in &tool.headers {
            if let Err(e) = Template::parse(value) {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].headers.{name}"),
                    e.to_string(),
                ));
            }
        }
        if let Some(body) = &tool.request_body {
            if let Err(e) = Template::parse(body) {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].requestBody"),
                    e.to_string(),
                ));
            }
        }
        if let Some(body) = &tool.response_body {
            if let Err(e) = Template::parse(body) {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].responseBody"),
                    e.to_string(),
                ));
            }
        }

        let mut seen_args = HashSet::new();
        for (ai, arg) in tool.args.iter().enumerate() {
            // Shadowing across positions is resolved by precedence, but an
            // exact (name, position) duplicate is a mistake.
            if !seen_args.insert((arg.name.as_str(), arg.position)) {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].args[{ai}].name"),
                    format!("duplicate argument '{}' at position {:?}", arg.name, arg.position),
                ));
            }
            if arg.required && arg.default.is_some() {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].args[{ai}].default"),
                    "required arguments cannot carry a default",
                ));
            }
            if arg.arg_type == "array" && arg.items.is_none() {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].args[{ai}].items"),
                    "array arguments must declare their item type",
                ));
            }
            if matches!(arg.position, ArgPosition::Header) && !arg.name.is_ascii() {
                errors.push(ValidationError::new(
                    config,
                    format!("tools[{i}].args[{ai}].name"),
                    "header argument names must be ASCII",
                ));
            }
        }
    }

    // Rule 6: outbound backend definitions.
    let mut seen_backends = HashSet::new();
    for (i, backend) in config.mcp_servers.iter().enumerate() {
        if !seen_backends.insert(backend.name.as_str()) {
            errors.push(ValidationError::new(
                config,
                format!("mcpServers[{i}].name"),
                format!("duplicate backend name '{}'", backend.name),
            ));
        }
        match backend.server_type {
            McpServerType::Stdio => {
                if backend.command.as_deref().unwrap_or("").is_empty() {
                    errors.push(ValidationError::new(
                        config,
                        format!("mcpServers[{i}].command"),
                        "stdio backends require a command",
                    ));
                }
            }
            McpServerType::Sse | McpServerType::StreamableHttp => {
                if backend.url.as_deref().unwrap_or("").is_empty() {
                    errors.push(ValidationError::new(
                        config,
                        format!("mcpServers[{i}].url"),
                        "http backends require a url",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RouterSpec, ServerSpec, ToolArg, ToolSpec};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn tenant(name: &str, prefix: &str) -> Tenant {
        Tenant {
            name: name.to_string(),
            prefix: prefix.to_string(),
            active: true,
        }
    }

    fn minimal_config(tenant: &str, name: &str, prefix: &str) -> McpConfig {
        McpConfig {
            name: name.to_string(),
            tenant: tenant.to_string(),
            servers: vec![ServerSpec {
                name: "srv".to_string(),
                description: None,
                allowed_tools: vec!["ping".to_string()],
                config: BTreeMap::new(),
            }],
            tools: vec![ToolSpec {
                name: "ping".to_string(),
                description: Some("ping".to_string()),
                summary: None,
                method: "GET".to_string(),
                endpoint: "http://up.test/p/{id}".to_string(),
                headers: BTreeMap::new(),
                args: vec![ToolArg {
                    name: "id".to_string(),
                    position: ArgPosition::Path,
                    arg_type: "string".to_string(),
                    required: true,
                    default: None,
                    description: None,
                    items: None,
                }],
                request_body: None,
                response_body: None,
                input_schema: None,
                timeout_ms: None,
                retry: None,
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

    #[test]
    fn accepts_a_well_formed_universe() {
        let configs = vec![minimal_config("t", "a", "/t/a")];
        assert!(validate_universe(&configs, &[tenant("t", "/t")]).is_ok());
    }

    #[test]
    fn rejects_prefix_outside_tenant() {
        let configs = vec![minimal_config("t", "a", "/tother/x")];
        let errors = validate_universe(&configs, &[tenant("t", "/t")]).unwrap_err();
        let err = &errors[0];
        assert_eq!(err.field_path, "routers[0].prefix");
        assert_eq!(err.tenant_prefix.as_deref(), Some("/t"));
    }

    #[test]
    fn sibling_tenant_name_is_not_containment() {
        // /tother starts with /t as a string but not as a path segment.
        assert!(!prefix_contained("/tother/x", "/t"));
        assert!(prefix_contained("/t/x", "/t"));
        assert!(prefix_contained("/t", "/t"));
    }

    #[test]
    fn rejects_duplicate_prefixes_across_configs() {
        let configs = vec![
            minimal_config("t", "a", "/t/x"),
            minimal_config("t", "b", "/t/x"),
        ];
        let errors = validate_universe(&configs, &[tenant("t", "/t")]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("already routed by config 't/a'"));
    }

    #[test]
    fn deleted_configs_release_their_prefixes() {
        let mut deleted = minimal_config("t", "a", "/t/x");
        deleted.deleted_at = Some(chrono::Utc::now());
        let configs = vec![deleted, minimal_config("t", "b", "/t/x")];
        assert!(validate_universe(&configs, &[tenant("t", "/t")]).is_ok());
    }

    #[test]
    fn trailing_slash_is_normalized_before_matching() {
        let configs = vec![minimal_config("t", "a", "/t/a/")];
        assert!(validate_universe(&configs, &[tenant("t", "/t")]).is_ok());
    }

    #[test]
    fn rejects_unknown_allowed_tool() {
        let mut config = minimal_config("t", "a", "/t/a");
        config.servers[0].allowed_tools.push("ghost".to_string());
        let errors = validate_universe(&[config], &[tenant("t", "/t")]).unwrap_err();
        assert_eq!(errors[0].field_path, "servers[0].allowedTools[1]");
    }

    #[test]
    fn rejects_required_arg_with_default() {
        let mut config = minimal_config("t", "a", "/t/a");
        config.tools[0].args[0].default = Some(serde_json::json!("x"));
        let errors = validate_universe(&[config], &[tenant("t", "/t")]).unwrap_err();
        assert!(errors[0].field_path.ends_with(".default"));
    }

    #[test]
    fn rejects_array_arg_without_items() {
        let mut config = minimal_config("t", "a", "/t/a");
        config.tools[0].args[0].required = false;
        config.tools[0].args[0].arg_type = "array".to_string();
        let errors = validate_universe(&[config], &[tenant("t", "/t")]).unwrap_err();
        assert!(errors[0].field_path.ends_with(".items"));
    }

    #[test]
    fn rejects_bad_method_and_bad_template() {
        let mut config = minimal_config("t", "a", "/t/a");
        config.tools[0].method = "FETCH".to_string();
        config.tools[0].endpoint = "{{.Config.url".to_string();
        let errors = validate_universe(&[config], &[tenant("t", "/t")]).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field_path.as_str()).collect();
        assert!(fields.contains(&"tools[0].method"));
        assert!(fields.contains(&"tools[0].endpoint"));
    }

    #[test]
    fn rejects_stdio_without_command() {
        let mut config = minimal_config("t", "a", "/t/a");
        config.mcp_servers.push(crate::model::McpServerSpec {
            name: "up".to_string(),
            server_type: McpServerType::Stdio,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            policy: Default::default(),
        });
        let errors = validate_universe(&[config], &[tenant("t", "/t")]).unwrap_err();
        assert_eq!(errors[0].field_path, "mcpServers[0].command");
    }

    #[test]
    fn validation_is_order_insensitive() {
        let a = minimal_config("t", "a", "/t/a");
        let b = minimal_config("t", "b", "/t/b");
        let tenants = [tenant("t", "/t")];
        let forward = validate_universe(&[a.clone(), b.clone()], &tenants);
        let backward = validate_universe(&[b, a], &tenants);
        assert_eq!(forward.is_ok(), backward.is_ok());
    }
}
