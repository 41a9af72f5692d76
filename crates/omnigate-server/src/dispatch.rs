//! JSON-RPC dispatch: the MCP method surface of the gateway.
//!
//! Requests yield a response; notifications yield nothing. Capability
//! lists merge the route's synthetic entities with whatever its upstream
//! backends advertised at the last sync, minus status-override masks.
//! `tools/call` resolution prefers synthetic tools and falls through to
//! the upstream that advertises the name.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::invoke::InboundRequest;
use crate::session::Session;
use crate::snapshot::CompiledRoute;
use crate::state::GatewayState;
use omnigate_core::gateway_version;
use omnigate_protocol::jsonrpc::{ClientMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use omnigate_protocol::types::{
    CallToolRequest, CallToolResult, CancelledParams, EmptyResult, GetPromptRequest,
    GetPromptResult, Implementation, InitializeRequest, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PromptsCapability, ReadResourceRequest, ReadResourceResult, ResourcesCapability,
    ServerCapabilities, Tool, ToolsCapability,
};
use omnigate_protocol::{methods, negotiate_version};

/// Handle one inbound message on a session.
///
/// Returns `None` for notifications and `Some(response)` for requests;
/// errors never escape, they become JSON-RPC error responses.
pub async fn handle_message(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    session: &Arc<Session>,
    message: ClientMessage,
    inbound: &InboundRequest,
) -> Option<JsonRpcResponse> {
    match message {
        ClientMessage::Notification(notification) => {
            handle_notification(session, &notification);
            None
        }
        ClientMessage::Request(request) => {
            Some(handle_request(state, route, session, request, inbound).await)
        }
    }
}

fn handle_notification(session: &Arc<Session>, notification: &JsonRpcNotification) {
    match notification.method.as_str() {
        methods::INITIALIZED => {
            debug!(session = %session.id, "client initialized");
        }
        methods::CANCELLED => {
            let Some(params) = notification
                .params
                .clone()
                .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
            else {
                warn!("cancellation notification without a request id");
                return;
            };
            let cancelled = session.cancel_request(&params.request_id);
            debug!(
                session = %session.id,
                request = %params.request_id,
                cancelled,
                reason = params.reason.as_deref().unwrap_or(""),
                "cancellation requested"
            );
        }
        other => debug!(method = other, "ignoring unknown notification"),
    }
}

async fn handle_request(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    session: &Arc<Session>,
    request: JsonRpcRequest,
    inbound: &InboundRequest,
) -> JsonRpcResponse {
    session.touch();
    let id = request.id.clone();
    let result = dispatch(state, route, session, &request, inbound).await;
    match result {
        Ok(value) => JsonRpcResponse::success(value, id),
        Err(error) => {
            debug!(method = %request.method, error = %error, "request failed");
            JsonRpcResponse::error(error.to_rpc_error(), Some(id))
        }
    }
}

async fn dispatch(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    session: &Arc<Session>,
    request: &JsonRpcRequest,
    inbound: &InboundRequest,
) -> GatewayResult<Value> {
    match request.method.as_str() {
        methods::INITIALIZE => initialize(route, request),
        methods::PING => Ok(serde_json::to_value(EmptyResult {})?),
        methods::TOOLS_LIST => tools_list(state, route),
        methods::TOOLS_CALL => tools_call(state, route, session, request, inbound).await,
        methods::PROMPTS_LIST => prompts_list(state, route),
        methods::PROMPTS_GET => prompts_get(state, route, request).await,
        methods::RESOURCES_LIST => resources_list(state, route),
        methods::RESOURCES_READ => resources_read(state, route, request).await,
        methods::RESOURCES_TEMPLATES_LIST => resource_templates_list(state, route),
        other => Err(GatewayError::MethodNotFound(other.to_string())),
    }
}

fn initialize(route: &Arc<CompiledRoute>, request: &JsonRpcRequest) -> GatewayResult<Value> {
    let client_version = request
        .params
        .clone()
        .and_then(|p| serde_json::from_value::<InitializeRequest>(p).ok())
        .map(|p| p.protocol_version)
        .unwrap_or_else(|| omnigate_protocol::LATEST_VERSION.to_string());
    let negotiated = negotiate_version(&client_version);

    let result = InitializeResult {
        protocol_version: negotiated.as_str().to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            prompts: Some(PromptsCapability::default()),
            resources: Some(ResourcesCapability::default()),
        },
        server_info: Implementation {
            name: format!("{}/{}", omnigate_core::GATEWAY_NAME, route.server.name),
            version: gateway_version(),
        },
        instructions: route.server.description.clone(),
    };
    Ok(serde_json::to_value(result)?)
}

fn tools_list(state: &Arc<GatewayState>, route: &Arc<CompiledRoute>) -> GatewayResult<Value> {
    let mut tools: Vec<Tool> = route
        .tools
        .values()
        .filter(|t| !route.disabled_tools.contains(&t.spec.name))
        .map(|t| t.advertised())
        .collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));

    for backend in &route.backends {
        let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) else {
            continue;
        };
        let masked = route.disabled_upstream.get(&backend.name);
        tools.extend(
            info.tools
                .into_iter()
                .filter(|t| masked.map_or(true, |set| !set.contains(&t.name))),
        );
    }

    Ok(serde_json::to_value(ListToolsResult {
        tools,
        next_cursor: None,
    })?)
}

async fn tools_call(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    session: &Arc<Session>,
    request: &JsonRpcRequest,
    inbound: &InboundRequest,
) -> GatewayResult<Value> {
    let params: CallToolRequest = parse_params(request)?;
    let cancel = session.begin_request(&request.id);
    let result = call_tool_inner(state, route, session, &params, inbound, &cancel).await;
    session.finish_request(&request.id);
    Ok(serde_json::to_value(result?)?)
}

async fn call_tool_inner(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    _session: &Arc<Session>,
    params: &CallToolRequest,
    inbound: &InboundRequest,
    cancel: &tokio_util::sync::CancellationToken,
) -> GatewayResult<CallToolResult> {
    // Synthetic tools win; upstream tools are the fallback.
    match state
        .invoker
        .invoke(route, &params.name, params.arguments.clone(), inbound, cancel)
        .await
    {
        Err(GatewayError::ToolNotFound(_)) => {}
        other => return other,
    }

    for backend in &route.backends {
        let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) else {
            continue;
        };
        if !info.tools.iter().any(|t| t.name == params.name) {
            continue;
        }
        if route
            .disabled_upstream
            .get(&backend.name)
            .is_some_and(|set| set.contains(&params.name))
        {
            return Err(GatewayError::ToolDisabled(params.name.clone()));
        }
        let transport = state.transport_for(&route.tenant, backend).await?;
        let call = transport.call_tool(&params.name, params.arguments.clone());
        return tokio::select! {
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = call => Ok(result?),
        };
    }
    Err(GatewayError::ToolNotFound(params.name.clone()))
}

fn prompts_list(state: &Arc<GatewayState>, route: &Arc<CompiledRoute>) -> GatewayResult<Value> {
    let mut prompts = route.prompts.clone();
    for backend in &route.backends {
        if let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) {
            prompts.extend(info.prompts);
        }
    }
    Ok(serde_json::to_value(ListPromptsResult {
        prompts,
        next_cursor: None,
    })?)
}

async fn prompts_get(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    request: &JsonRpcRequest,
) -> GatewayResult<Value> {
    let params: GetPromptRequest = parse_params(request)?;

    if let Some(prompt) = route.prompts.iter().find(|p| p.name == params.name) {
        // Synthetic prompts carry no message bodies; serve the metadata.
        let result = GetPromptResult {
            description: prompt.description.clone(),
            messages: Vec::new(),
        };
        return Ok(serde_json::to_value(result)?);
    }

    for backend in &route.backends {
        let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) else {
            continue;
        };
        if info.prompts.iter().any(|p| p.name == params.name) {
            let transport = state.transport_for(&route.tenant, backend).await?;
            let value = transport
                .request(methods::PROMPTS_GET, Some(serde_json::to_value(&params)?))
                .await?;
            return Ok(value);
        }
    }
    Err(GatewayError::NotFound(format!("prompt '{}'", params.name)))
}

fn resources_list(state: &Arc<GatewayState>, route: &Arc<CompiledRoute>) -> GatewayResult<Value> {
    let mut resources = route.resources.clone();
    for backend in &route.backends {
        if let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) {
            resources.extend(info.resources);
        }
    }
    Ok(serde_json::to_value(ListResourcesResult {
        resources,
        next_cursor: None,
    })?)
}

async fn resources_read(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
    request: &JsonRpcRequest,
) -> GatewayResult<Value> {
    let params: ReadResourceRequest = parse_params(request)?;

    for backend in &route.backends {
        let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) else {
            continue;
        };
        if info.resources.iter().any(|r| r.uri == params.uri) {
            let transport = state.transport_for(&route.tenant, backend).await?;
            let value = transport
                .request(methods::RESOURCES_READ, Some(serde_json::to_value(&params)?))
                .await?;
            return Ok(value);
        }
    }

    // Synthetic resources are declarative only; there is no body to read.
    if route.resources.iter().any(|r| r.uri == params.uri) {
        let result = ReadResourceResult {
            contents: Vec::new(),
        };
        return Ok(serde_json::to_value(result)?);
    }
    Err(GatewayError::NotFound(format!("resource '{}'", params.uri)))
}

fn resource_templates_list(
    state: &Arc<GatewayState>,
    route: &Arc<CompiledRoute>,
) -> GatewayResult<Value> {
    let mut resource_templates = route.resource_templates.clone();
    for backend in &route.backends {
        if let Some(info) = state.cached_capabilities(&route.tenant, &backend.name) {
            resource_templates.extend(info.resource_templates);
        }
    }
    Ok(serde_json::to_value(ListResourceTemplatesResult {
        resource_templates,
        next_cursor: None,
    })?)
}

fn parse_params<T: serde::de::DeserializeOwned>(request: &JsonRpcRequest) -> GatewayResult<T> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| GatewayError::InvalidParams("missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| GatewayError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionProtocol;
    use crate::state::GatewayConfig;
    use omnigate_config::{
        ArgPosition, ConfigStore, McpConfig, MemoryStore, RouterSpec, ServerSpec, Tenant, ToolArg,
        ToolSpec,
    };
    use omnigate_core::RequestId;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn setup(prefix: &str) -> (Arc<GatewayState>, Arc<CompiledRoute>, Arc<Session>) {
        let store = Arc::new(MemoryStore::new());
        store
            .put_tenant(Tenant {
                name: "t".to_string(),
                prefix: "/t".to_string(),
                active: true,
            })
            .await
            .unwrap();
        let config = McpConfig {
            name: "c".to_string(),
            tenant: "t".to_string(),
            servers: vec![ServerSpec {
                name: "srv".to_string(),
                description: Some("test server".to_string()),
                allowed_tools: vec!["ping".to_string()],
                config: BTreeMap::new(),
            }],
            tools: vec![ToolSpec {
                name: "ping".to_string(),
                description: Some("probe".to_string()),
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
        };
        store.create(config, "op").await.unwrap();

        let state = GatewayState::new(store, GatewayConfig::default());
        state.reload().await.unwrap();
        let (route, _) = state.snapshot().match_path(prefix).unwrap();
        let session = state.sessions.create("t", prefix, SessionProtocol::Sse);
        (state, route, session)
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(method, params, RequestId::Number(1))
    }

    #[tokio::test]
    async fn initialize_negotiates_known_version() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request(
                "initialize",
                Some(json!({"protocolVersion": "2025-03-26"})),
            )),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "omnigate/srv");
        assert_eq!(result["instructions"], "test server");
    }

    #[tokio::test]
    async fn initialize_degrades_unknown_version() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request(
                "initialize",
                Some(json!({"protocolVersion": "1999-01-01"})),
            )),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            response.result.unwrap()["protocolVersion"],
            "2024-11-05"
        );
    }

    #[tokio::test]
    async fn tools_list_returns_synthetic_tools() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request("tools/list", None)),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "ping");
        assert_eq!(tools[0]["description"], "probe");
    }

    #[tokio::test]
    async fn unknown_method_maps_to_32601() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request("logging/setLevel", Some(json!({})))),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_32001() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request(
                "tools/call",
                Some(json!({"name": "ghost", "arguments": {}})),
            )),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn ping_answers_empty_result() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request("ping", None)),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn notifications_yield_no_response() {
        let (state, route, session) = setup("/t/c").await;
        let nothing = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Notification(JsonRpcNotification::new(
                "notifications/initialized",
                None,
            )),
            &InboundRequest::default(),
        )
        .await;
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn cancellation_notification_cancels_pending_request() {
        let (state, route, session) = setup("/t/c").await;
        let token = session.begin_request(&RequestId::Number(42));
        assert!(!token.is_cancelled());

        handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Notification(JsonRpcNotification::new(
                "notifications/cancelled",
                Some(json!({"requestId": 42, "reason": "user"})),
            )),
            &InboundRequest::default(),
        )
        .await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn prompt_lookup_miss_is_not_found() {
        let (state, route, session) = setup("/t/c").await;
        let response = handle_message(
            &state,
            &route,
            &session,
            ClientMessage::Request(request("prompts/get", Some(json!({"name": "none"})))),
            &InboundRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32000);
    }
}
