//! End-to-end flows over the HTTP surface and the reload path.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method as http_method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use omnigate_config::{
    ArgPosition, ConfigStore, McpConfig, MemoryStore, RouterSpec, ServerSpec, Tenant, ToolArg,
    ToolSpec,
};
use omnigate_server::session::Replay;
use omnigate_server::{router, GatewayConfig, GatewayState, SessionProtocol, MCP_SESSION_HEADER};

fn tool(name: &str, endpoint: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        summary: None,
        method: "GET".to_string(),
        endpoint: endpoint.to_string(),
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
    }
}

fn gateway_config(tools: Vec<ToolSpec>, upstream_url: &str) -> McpConfig {
    let allowed = tools.iter().map(|t| t.name.clone()).collect();
    let mut server_config = BTreeMap::new();
    server_config.insert("url".to_string(), upstream_url.to_string());
    McpConfig {
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
    }
}

async fn gateway(upstream_url: &str) -> (Arc<GatewayState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .put_tenant(Tenant {
            name: "t".to_string(),
            prefix: "/t".to_string(),
            active: true,
        })
        .await
        .unwrap();
    store
        .create(
            gateway_config(
                vec![tool("ping", "{{.Config.url}}/p/{{.Args.id}}")],
                upstream_url,
            ),
            "op",
        )
        .await
        .unwrap();

    let state = GatewayState::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        GatewayConfig::default(),
    );
    state.reload().await.unwrap();
    (state, store)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn streamable_initialize_assigns_a_session() {
    let (state, _store) = gateway("http://unused.test").await;
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/t/c")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26"},
                "id": 1
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(MCP_SESSION_HEADER));
    let body = body_json(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
}

#[tokio::test]
async fn streamable_tool_call_escalates_to_event_stream() {
    let upstream = MockServer::start().await;
    Mock::given(http_method("GET"))
        .and(path("/p/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"pong":true}"#))
        .mount(&upstream)
        .await;

    let (state, _store) = gateway(&upstream.uri()).await;
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/t/c")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": {"name": "ping", "arguments": {"id": "42"}},
                "id": 2
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(raw.contains("event: message"));
    assert!(raw.contains("event: done"));
    assert!(raw.contains("pong"));
}

#[tokio::test]
async fn message_endpoint_queues_responses_onto_the_session_stream() {
    let (state, _store) = gateway("http://unused.test").await;
    let session = state
        .sessions
        .create("t", "/t/c", SessionProtocol::Sse);
    let app = router(Arc::clone(&state));

    let request = Request::builder()
        .method("POST")
        .uri(format!("/t/c/message?sessionId={}", session.id.as_str()))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "method": "tools/list",
                "id": 7
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let Replay::Events(events) = session.replay_after(0) else {
        panic!("expected buffered events");
    };
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "message");
    let envelope: Value = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(envelope["id"], 7);
    assert_eq!(envelope["result"]["tools"][0]["name"], "ping");
}

#[tokio::test]
async fn unknown_prefix_is_a_404() {
    let (state, _store) = gateway("http://unused.test").await;
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/nowhere")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hot_reload_adds_tools_without_dropping_sessions() {
    let (state, store) = gateway("http://unused.test").await;

    // An SSE session is open and has already seen one event.
    let session = state.sessions.create("t", "/t/c", SessionProtocol::Sse);
    let first_seq = session.send_event("endpoint", "/t/c/message".to_string());
    assert_eq!(first_seq, 1);

    // The operator adds a second tool and the notifier fires a reload.
    store
        .update(
            gateway_config(
                vec![
                    tool("ping", "{{.Config.url}}/p/{{.Args.id}}"),
                    tool("extra", "{{.Config.url}}/x/{{.Args.id}}"),
                ],
                "http://unused.test",
            ),
            "op",
        )
        .await
        .unwrap();
    state.reload().await.unwrap();

    // Same session, same stream: the new tool shows up.
    let app = router(Arc::clone(&state));
    let request = Request::builder()
        .method("POST")
        .uri(format!("/t/c/message?sessionId={}", session.id.as_str()))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert!(state.sessions.get(session.id.as_str()).is_some());
    let Replay::Events(events) = session.replay_after(first_seq) else {
        panic!("expected buffered events");
    };
    // Sequence continued from its previous value.
    assert_eq!(events[0].seq, first_seq + 1);
    let envelope: Value = serde_json::from_str(&events[0].data).unwrap();
    let names: Vec<&str> = envelope["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"ping"));
    assert!(names.contains(&"extra"));
}

#[tokio::test]
async fn health_endpoint_reports_generation_and_sessions() {
    let (state, _store) = gateway("http://unused.test").await;
    state.sessions.create("t", "/t/c", SessionProtocol::Sse);
    let app = router(state);

    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["generation"], 1);
    assert_eq!(body["sessions"], 1);
}
