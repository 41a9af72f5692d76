//! Tool invocation: `tools/call` → outbound HTTP.
//!
//! The invoker validates arguments against the declared types (and the
//! JSON Schema when one is present), renders the endpoint, headers and
//! body templates, executes the call under the session's cancellation
//! token, and shapes the response back into MCP content.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::snapshot::{CompiledRoute, CompiledTool};
use omnigate_config::{ArgPosition, ToolArg};
use omnigate_core::RetryPolicy;
use omnigate_protocol::types::CallToolResult;
use omnigate_template::RenderContext;

/// Default per-call deadline when the tool does not override it.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-request data the invoker forwards into templates.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Selected inbound headers (`Authorization` and friends)
    pub headers: BTreeMap<String, String>,
    /// Inbound query parameters
    pub query: BTreeMap<String, String>,
}

/// Executes synthesized tools over HTTP.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    http: reqwest::Client,
}

impl Default for ToolInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolInvoker {
    /// Create an invoker with a shared HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Run a `tools/call` against the route's matching tool.
    pub async fn invoke(
        &self,
        route: &CompiledRoute,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        inbound: &InboundRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<CallToolResult> {
        let tool = route.tool(tool_name)?;
        let args = validate_arguments(&tool, arguments.unwrap_or_default())?;

        let mut ctx = RenderContext::default();
        ctx.config = route.server.config.clone();
        ctx.args = args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ctx.request.headers = inbound.headers.clone();
        ctx.request.query = inbound.query.clone();

        let method: Method = tool
            .spec
            .method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| GatewayError::Internal(format!("bad method '{}'", tool.spec.method)))?;
        let url = build_url(&tool, &ctx, &args)?;
        let headers = build_headers(&tool, &ctx, inbound)?;
        let body = build_body(&tool, &ctx, &args)?;

        debug!(tool = %tool.spec.name, %method, %url, "invoking synthesized tool");

        let timeout = tool
            .spec
            .timeout_ms
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis);
        let retry = tool.spec.retry.unwrap_or(RetryPolicy::None);
        let attempts = if method_is_idempotent(&method) {
            retry.attempts()
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(tool = %tool.spec.name, attempt, ?delay, "retrying upstream call");
                tokio::time::sleep(delay).await;
            }
            match self
                .execute_once(&method, &url, &headers, body.as_deref(), timeout, cancel)
                .await
            {
                Ok((status, raw)) => {
                    if !(200..300).contains(&status) {
                        let err = GatewayError::upstream_status(status, &raw);
                        if attempt < attempts && transient_status(status) {
                            last_err = Some(err);
                            continue;
                        }
                        return Err(err);
                    }
                    return shape_response(&tool, &ctx, raw);
                }
                Err(err @ (GatewayError::Cancelled | GatewayError::Timeout)) => {
                    // Never retried: the caller is gone or out of time.
                    return Err(err);
                }
                Err(err) => {
                    let transient = matches!(
                        &err,
                        GatewayError::Transport(t) if t.is_transient()
                    );
                    if attempt < attempts && transient {
                        warn!(tool = %tool.spec.name, error = %err, "transient upstream failure");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Internal("retry loop exhausted".into())))
    }

    async fn execute_once(
        &self,
        method: &Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> GatewayResult<(u16, String)> {
        let mut request = self.http.request(method.clone(), url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            {
                request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            request = request.body(body.to_string());
        }

        let send = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let raw = response.text().await?;
            Ok::<_, reqwest::Error>((status, raw))
        };

        tokio::select! {
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = send => result.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Transport(e.into())
                }
            }),
        }
    }
}

fn method_is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

fn transient_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

/// Apply declared-argument rules: requiredness, defaults, coercion, item
/// types, and the optional JSON Schema. Unknown arguments pass through.
fn validate_arguments(
    tool: &CompiledTool,
    mut supplied: Map<String, Value>,
) -> GatewayResult<Map<String, Value>> {
    // Resolve shadowed names by position precedence before checking.
    let mut declared: Vec<&ToolArg> = Vec::new();
    for arg in &tool.spec.args {
        if declared.iter().any(|a| a.name == arg.name) {
            continue;
        }
        declared.push(tool.spec.arg(&arg.name).unwrap_or(arg));
    }

    for arg in &declared {
        match supplied.get(&arg.name) {
            None | Some(Value::Null) => {
                if let Some(default) = &arg.default {
                    supplied.insert(arg.name.clone(), default.clone());
                } else if arg.required {
                    return Err(GatewayError::InvalidParams(format!(
                        "missing required argument '{}'",
                        arg.name
                    )));
                }
            }
            Some(value) => {
                let coerced = coerce_value(value.clone(), &arg.arg_type, &arg.name)?;
                if arg.arg_type == "array" {
                    if let (Some(items), Value::Array(elements)) = (&arg.items, &coerced) {
                        for element in elements {
                            check_element_type(element, &items.item_type, &arg.name)?;
                        }
                    }
                }
                supplied.insert(arg.name.clone(), coerced);
            }
        }
    }

    if let Some(schema) = &tool.input_schema {
        let instance = Value::Object(supplied.clone());
        let validation_result = schema.validate(&instance);
        if let Err(errors) = validation_result {
            let detail = errors
                .map(|e| format!("{}: {e}", e.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::InvalidParams(format!(
                "schema validation failed: {detail}"
            )));
        }
    }
    Ok(supplied)
}

/// Coerce string-encoded scalars toward the declared type; reject values
/// whose shape cannot match at all.
fn coerce_value(value: Value, declared: &str, name: &str) -> GatewayResult<Value> {
    let mismatch = |value: &Value| {
        GatewayError::InvalidParams(format!(
            "argument '{name}' expected {declared}, got {}",
            type_of(value)
        ))
    };
    match declared {
        "integer" => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        "number" => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        "boolean" => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        "string" => match value {
            Value::String(_) => Ok(value),
            // Scalars stringify losslessly for path/query/header use.
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(mismatch(&other)),
        },
        "array" => match &value {
            Value::Array(_) => Ok(value),
            _ => Err(mismatch(&value)),
        },
        "object" => match &value {
            Value::Object(_) => Ok(value),
            _ => Err(mismatch(&value)),
        },
        _ => Ok(value),
    }
}

fn check_element_type(element: &Value, item_type: &str, name: &str) -> GatewayResult<()> {
    let ok = match item_type {
        "string" => element.is_string(),
        "integer" => element.as_i64().is_some(),
        "number" => element.is_number(),
        "boolean" => element.is_boolean(),
        "object" => element.is_object(),
        "array" => element.is_array(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidParams(format!(
            "argument '{name}' items must be {item_type}, got {}",
            type_of(element)
        )))
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn build_url(
    tool: &CompiledTool,
    ctx: &RenderContext,
    args: &Map<String, Value>,
) -> GatewayResult<String> {
    let rendered = tool.endpoint.render(ctx)?;
    let mut url = url::Url::parse(&rendered)
        .map_err(|e| GatewayError::Internal(format!("rendered endpoint '{rendered}': {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        for arg in tool
            .spec
            .args
            .iter()
            .filter(|a| a.position == ArgPosition::Query)
        {
            let Some(value) = args.get(&arg.name) else {
                continue;
            };
            match value {
                Value::Array(elements) => {
                    for element in elements {
                        pairs.append_pair(&arg.name, &scalar_to_string(element));
                    }
                }
                other => {
                    pairs.append_pair(&arg.name, &scalar_to_string(other));
                }
            }
        }
    }
    Ok(url.to_string())
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

fn build_headers(
    tool: &CompiledTool,
    ctx: &RenderContext,
    inbound: &InboundRequest,
) -> GatewayResult<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for (name, template) in &tool.headers {
        let value = template.render(ctx)?;
        if !value.is_empty() {
            headers.push((name.clone(), value));
        }
    }
    // Header-position arguments ride along too.
    for arg in tool
        .spec
        .args
        .iter()
        .filter(|a| a.position == ArgPosition::Header)
    {
        if let Some(value) = ctx.args.get(&arg.name) {
            headers.push((arg.name.clone(), scalar_to_string(value)));
        }
    }
    // Authorization passes through from the client unless the tool set it.
    if !headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("authorization"))
    {
        if let Some(auth) = inbound
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .map(|(_, v)| v.clone())
        {
            headers.push(("Authorization".to_string(), auth));
        }
    }
    Ok(headers)
}

/// Render the request body when the tool carries body arguments.
fn build_body(
    tool: &CompiledTool,
    ctx: &RenderContext,
    args: &Map<String, Value>,
) -> GatewayResult<Option<String>> {
    let body_args: Vec<&ToolArg> = tool
        .spec
        .args
        .iter()
        .filter(|a| a.position == ArgPosition::Body)
        .collect();
    if body_args.is_empty() && tool.request_body.is_none() {
        return Ok(None);
    }

    if let Some(template) = &tool.request_body {
        return Ok(Some(template.render(ctx)?));
    }

    // No template: assemble a JSON object from the body args, types intact.
    let mut body = Map::new();
    for arg in body_args {
        if let Some(value) = args.get(&arg.name) {
            body.insert(arg.name.clone(), value.clone());
        }
    }
    Ok(Some(serde_json::to_string(&Value::Object(body))?))
}

/// Shape the upstream response. The default is a raw passthrough of the
/// body; a `responseBody` template renders against the parsed JSON.
fn shape_response(
    tool: &CompiledTool,
    ctx: &RenderContext,
    raw: String,
) -> GatewayResult<CallToolResult> {
    let Some(template) = &tool.response_body else {
        return Ok(CallToolResult::text(raw));
    };
    let mut response_ctx = ctx.clone();
    response_ctx.response.data = serde_json::from_str(&raw).unwrap_or(Value::Null);
    response_ctx.response.body = raw;
    let rendered = template.render(&response_ctx)?;
    Ok(CallToolResult::text(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RoutingSnapshot;
    use omnigate_config::{
        McpConfig, RouterSpec, ServerSpec, Tenant, ToolSpec,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string, header, method as http_method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route_for(tools: Vec<ToolSpec>, server_config: BTreeMap<String, String>) -> CompiledRoute {
        let allowed = tools.iter().map(|t| t.name.clone()).collect();
        let config = McpConfig {
            name: "c".to_string(),
            tenant: "t".to_string(),
            servers: vec![ServerSpec {
                name: "srv".to_string(),
                description: None,
                allowed_tools: allowed,
                config: server_config,
            }],
            tools,
            routers: vec![RouterSpec {
                server: "srv".to_string(),
                prefix: "/t/c".to_string(),
                cors: None,
                sse_prefix: None,
            }],
            ..Default::default()
        };
        let tenants = [Tenant {
            name: "t".to_string(),
            prefix: "/t".to_string(),
            active: true,
        }];
        let snapshot = RoutingSnapshot::build(1, &[config], &tenants, &[]).unwrap();
        let (route, _) = snapshot.match_path("/t/c").unwrap();
        drop(snapshot);
        Arc::try_unwrap(route).map_err(|_| ()).unwrap()
    }

    fn get_tool(endpoint: &str) -> ToolSpec {
        ToolSpec {
            name: "ping".to_string(),
            description: Some("probe".to_string()),
            summary: None,
            method: "GET".to_string(),
            endpoint: endpoint.to_string(),
            headers: BTreeMap::new(),
            args: vec![omnigate_config::ToolArg {
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
        }
    }

    #[tokio::test]
    async fn get_tool_renders_path_and_passes_body_through() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/42"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"pong":true}"#))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let route = route_for(vec![get_tool("{{.Config.url}}/p/{{.Args.id}}")], config);

        let invoker = ToolInvoker::new();
        let result = invoker
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "42"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let omnigate_protocol::types::Content::Text { text } = &result.content[0] else {
            panic!("expected text content");
        };
        assert_eq!(text, r#"{"pong":true}"#);
    }

    #[tokio::test]
    async fn body_args_preserve_json_types() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/items"))
            .and(body_string(r#"{"n":7,"flag":true,"tags":["a","b"]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let tool = ToolSpec {
            name: "create".to_string(),
            description: None,
            summary: None,
            method: "POST".to_string(),
            endpoint: "{{.Config.url}}/items".to_string(),
            headers: BTreeMap::new(),
            args: vec![
                arg("n", ArgPosition::Body, "integer", true, None),
                arg("flag", ArgPosition::Body, "boolean", true, None),
                array_arg("tags", "string"),
            ],
            request_body: Some(
                r#"{"n":{{.Args.n | toJSON}},"flag":{{.Args.flag | toJSON}},"tags":{{.Args.tags | toJSON}}}"#
                    .to_string(),
            ),
            response_body: None,
            input_schema: None,
            timeout_ms: None,
            retry: None,
        };
        let route = route_for(vec![tool], config);

        let result = ToolInvoker::new()
            .invoke(
                &route,
                "create",
                Some(
                    json!({"n": 7, "flag": true, "tags": ["a", "b"]})
                        .as_object()
                        .unwrap()
                        .clone(),
                ),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.is_error.is_none());
    }

    fn arg(
        name: &str,
        position: ArgPosition,
        arg_type: &str,
        required: bool,
        default: Option<Value>,
    ) -> omnigate_config::ToolArg {
        omnigate_config::ToolArg {
            name: name.to_string(),
            position,
            arg_type: arg_type.to_string(),
            required,
            default,
            description: None,
            items: None,
        }
    }

    fn array_arg(name: &str, item_type: &str) -> omnigate_config::ToolArg {
        omnigate_config::ToolArg {
            name: name.to_string(),
            position: ArgPosition::Body,
            arg_type: "array".to_string(),
            required: true,
            default: None,
            description: None,
            items: Some(omnigate_config::model::ArgItems {
                item_type: item_type.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn query_args_and_defaults() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let tool = ToolSpec {
            name: "search".to_string(),
            description: None,
            summary: None,
            method: "GET".to_string(),
            endpoint: "{{.Config.url}}/search".to_string(),
            headers: BTreeMap::new(),
            args: vec![
                arg("q", ArgPosition::Query, "string", true, None),
                arg("limit", ArgPosition::Query, "integer", false, Some(json!(10))),
            ],
            request_body: None,
            response_body: None,
            input_schema: None,
            timeout_ms: None,
            retry: None,
        };
        let route = route_for(vec![tool], config);

        ToolInvoker::new()
            .invoke(
                &route,
                "search",
                Some(json!({"q": "rust"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn authorization_passes_through_by_default() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let route = route_for(vec![get_tool("{{.Config.url}}/p/{{.Args.id}}")], config);

        let mut inbound = InboundRequest::default();
        inbound
            .headers
            .insert("Authorization".to_string(), "Bearer tok".to_string());

        ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "1"}).as_object().unwrap().clone()),
                &inbound,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_required_arg_is_invalid_params() {
        let mut config = BTreeMap::new();
        config.insert("url".to_string(), "http://unused.test".to_string());
        let route = route_for(vec![get_tool("{{.Config.url}}/p/{{.Args.id}}")], config);

        let err = ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                None,
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn numeric_strings_coerce_to_declared_types() {
        let tool = ToolSpec {
            name: "t".to_string(),
            description: None,
            summary: None,
            method: "GET".to_string(),
            endpoint: "http://unused.test/x".to_string(),
            headers: BTreeMap::new(),
            args: vec![arg("n", ArgPosition::Query, "integer", true, None)],
            request_body: None,
            response_body: None,
            input_schema: None,
            timeout_ms: None,
            retry: None,
        };
        let route = route_for(vec![tool], BTreeMap::new());
        let compiled = route.tool("t").unwrap();

        let validated = validate_arguments(
            &compiled,
            json!({"n": "7"}).as_object().unwrap().clone(),
        )
        .unwrap();
        assert_eq!(validated["n"], json!(7));

        let err = validate_arguments(
            &compiled,
            json!({"n": "seven"}).as_object().unwrap().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn non_2xx_maps_to_upstream_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let route = route_for(vec![get_tool("{{.Config.url}}/p/{{.Args.id}}")], config);

        let err = ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "1"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32000);
        assert_eq!(rpc.data.unwrap()["status"], 500);
    }

    #[tokio::test]
    async fn response_template_shapes_parsed_json() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"user":{"name":"ada"},"noise":1}"#),
            )
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let mut tool = get_tool("{{.Config.url}}/p/{{.Args.id}}");
        tool.response_body = Some("{{.Response.Data.user.name}}".to_string());
        let route = route_for(vec![tool], config);

        let result = ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "1"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let omnigate_protocol::types::Content::Text { text } = &result.content[0] else {
            panic!("expected text");
        };
        assert_eq!(text, "ada");
    }

    #[tokio::test]
    async fn cancellation_aborts_a_hanging_upstream() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let route = route_for(vec![get_tool("{{.Config.url}}/p/{{.Args.id}}")], config);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "1"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_once_for_idempotent_methods() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(http_method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let mut config = BTreeMap::new();
        config.insert("url".to_string(), server.uri());
        let mut tool = get_tool("{{.Config.url}}/p/{{.Args.id}}");
        tool.retry = Some(RetryPolicy::Fixed {
            attempts: 2,
            delay_ms: 1,
            jitter_ms: 1,
        });
        let route = route_for(vec![tool], config);

        let result = ToolInvoker::new()
            .invoke(
                &route,
                "ping",
                Some(json!({"id": "1"}).as_object().unwrap().clone()),
                &InboundRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let omnigate_protocol::types::Content::Text { text } = &result.content[0] else {
            panic!("expected text");
        };
        assert_eq!(text, "recovered");
    }
}
