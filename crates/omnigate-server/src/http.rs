//! The gateway's HTTP surface.
//!
//! Router prefixes are config-driven, so a single fallback handler does
//! the longest-prefix match against the published snapshot and then
//! dispatches on the path remainder:
//!
//! - `GET  <prefix>/sse`       → SSE session stream
//! - `POST <prefix>/message`   → JSON-RPC for an SSE session
//! - `POST <prefix>`           → streamable-HTTP exchange
//!
//! Handler panics are isolated per request task and surface as `-32603`
//! plus session close; they never take the process down.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use crate::dispatch::handle_message;
use crate::error::GatewayError;
use crate::invoke::InboundRequest;
use crate::session::{Replay, Session, SessionEvent, SessionProtocol, RESYNC_EVENT};
use crate::snapshot::CompiledRoute;
use crate::state::GatewayState;
use omnigate_protocol::jsonrpc::{codes, ClientMessage, JsonRpcError, JsonRpcResponse};

/// Session id header shared with streamable clients.
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";
/// SSE resume header.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .fallback(gateway_handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown signal fires, then drain gracefully.
pub async fn serve(
    state: Arc<GatewayState>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(Arc::clone(&state));
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    state.shutdown().await;
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": omnigate_core::gateway_version(),
        "generation": state.generation(),
        "sessions": state.sessions.len(),
    }))
}

async fn gateway_handler(
    State(state): State<Arc<GatewayState>>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let snapshot = state.snapshot();

    let Some((route, rest)) = snapshot.match_path(&path) else {
        return not_found_response(&path);
    };
    let rest = rest.trim_end_matches('/');
    let query = parse_query(parts.uri.query().unwrap_or(""));

    if parts.method == Method::OPTIONS {
        return preflight_response(&route);
    }

    let response = if parts.method == Method::GET && rest == route.sse_suffix {
        sse_handler(state, route.clone(), &parts.headers, &query).await
    } else if parts.method == Method::POST && (rest == "/message" || rest == "/messages") {
        message_handler(state, route.clone(), &parts.headers, &query, body).await
    } else if parts.method == Method::POST && rest.is_empty() {
        streamable_handler(state, route.clone(), &parts.headers, &query, body).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    };
    with_cors(&route, response)
}

fn not_found_response(path: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no route for '{path}'")})),
    )
        .into_response()
}

fn parse_query(raw: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn inbound_from(headers: &HeaderMap, query: &BTreeMap<String, String>) -> InboundRequest {
    let mut inbound = InboundRequest {
        headers: BTreeMap::new(),
        query: query.clone(),
    };
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            inbound
                .headers
                .insert(canonical_header(name.as_str()), value.to_string());
        }
    }
    inbound
}

/// `authorization` → `Authorization`, so templates can use the familiar
/// capitalized form regardless of what the client sent.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------- SSE

async fn sse_handler(
    state: Arc<GatewayState>,
    route: Arc<CompiledRoute>,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
) -> Response {
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let (session, resumed) = match query.get("sessionId") {
        Some(id) => match state.sessions.get(id) {
            Some(session) => (session, true),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "session not found"})),
                )
                    .into_response();
            }
        },
        None => {
            let session =
                state
                    .sessions
                    .create(route.tenant.clone(), route.prefix.clone(), SessionProtocol::Sse);
            (session, false)
        }
    };

    if !resumed {
        let endpoint = format!(
            "{}/message?sessionId={}",
            route.prefix,
            session.id.as_str()
        );
        session.send_event("endpoint", endpoint);
    }

    let rx = session.attach();
    let replay = match last_event_id {
        Some(seen) => match session.replay_after(seen) {
            Replay::Events(events) => events,
            Replay::ResyncRequired => {
                // History is gone; tell the client to start over.
                session.send_event(RESYNC_EVENT, String::new());
                Vec::new()
            }
        },
        None => match session.replay_after(0) {
            Replay::Events(events) => events,
            Replay::ResyncRequired => Vec::new(),
        },
    };

    debug!(
        session = %session.id,
        resumed,
        replayed = replay.len(),
        "sse stream attached"
    );

    let detach_guard = DetachOnDrop {
        session: Arc::clone(&session),
    };
    let live = UnboundedReceiverStream::new(rx).map(move |event| {
        let _keep = &detach_guard;
        Ok::<Event, Infallible>(to_sse_event(&event))
    });
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(futures::stream::iter(replay.into_iter().map(|e| Ok(to_sse_event(&e)))).chain(live));

    let heartbeat = state.sessions.config().heartbeat_interval;
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("ping"))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(session.id.as_str()) {
        response.headers_mut().insert(MCP_SESSION_HEADER, value);
    }
    response
}

fn to_sse_event(event: &SessionEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.name.clone())
        .data(event.data.clone())
}

struct DetachOnDrop {
    session: Arc<Session>,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        debug!(session = %self.session.id, "sse stream detached");
        self.session.detach();
    }
}

// ------------------------------------------------------------ message

async fn message_handler(
    state: Arc<GatewayState>,
    route: Arc<CompiledRoute>,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
    body: Body,
) -> Response {
    let session_id = query
        .get("sessionId")
        .cloned()
        .or_else(|| header_string(headers, MCP_SESSION_HEADER));
    let Some(session) = session_id.and_then(|id| state.sessions.get(&id)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response();
    };

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let message: ClientMessage = match serde_json::from_slice(&bytes) {
        Ok(message) => message,
        Err(e) => {
            let response = JsonRpcResponse::parse_error(e.to_string());
            session.send_event("message", encode(&response));
            return accepted(&session);
        }
    };

    let inbound = inbound_from(headers, query);
    let task = {
        let state = Arc::clone(&state);
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            handle_message(&state, &route, &session, message, &inbound).await
        })
    };
    match task.await {
        Ok(Some(response)) => {
            session.send_event("message", encode(&response));
        }
        Ok(None) => {}
        Err(join_error) => {
            // A panic in the handler becomes a final -32603 and closes
            // the session; the process keeps serving.
            error!(session = %session.id, error = %join_error, "request task failed");
            let response = JsonRpcResponse::error(
                JsonRpcError::new(codes::INTERNAL_ERROR, "internal error", None),
                None,
            );
            session.send_event("message", encode(&response));
            state.sessions.remove(session.id.as_str());
        }
    }
    accepted(&session)
}

fn accepted(session: &Arc<Session>) -> Response {
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Ok(value) = HeaderValue::from_str(session.id.as_str()) {
        response.headers_mut().insert(MCP_SESSION_HEADER, value);
    }
    response
}

fn encode(response: &JsonRpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"encoding failed"},"id":null}"#
            .to_string()
    })
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// --------------------------------------------------------- streamable

async fn streamable_handler(
    state: Arc<GatewayState>,
    route: Arc<CompiledRoute>,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
    body: Body,
) -> Response {
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let message: ClientMessage = match serde_json::from_slice(&bytes) {
        Ok(message) => message,
        Err(e) => {
            return Json(JsonRpcResponse::parse_error(e.to_string())).into_response();
        }
    };

    let session = match header_string(headers, MCP_SESSION_HEADER) {
        Some(id) => match state.sessions.get(&id) {
            Some(session) => session,
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "session not found"})),
                )
                    .into_response();
            }
        },
        None => state.sessions.create(
            route.tenant.clone(),
            route.prefix.clone(),
            SessionProtocol::StreamableHttp,
        ),
    };
    session.touch();

    let is_tool_call = matches!(
        &message,
        ClientMessage::Request(request) if request.method == omnigate_protocol::methods::TOOLS_CALL
    );

    let inbound = inbound_from(headers, query);
    let task = {
        let state = Arc::clone(&state);
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            handle_message(&state, &route, &session, message, &inbound).await
        })
    };
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(session = %session.id, error = %join_error, "request task failed");
            state.sessions.remove(session.id.as_str());
            let error = GatewayError::Internal("request task panicked".to_string());
            Some(JsonRpcResponse::error(error.to_rpc_error(), None))
        }
    };

    match outcome {
        None => accepted(&session),
        Some(response) => {
            if is_tool_call {
                stream_response(&session, response)
            } else {
                let mut http = Json(response).into_response();
                if let Ok(value) = HeaderValue::from_str(session.id.as_str()) {
                    http.headers_mut().insert(MCP_SESSION_HEADER, value);
                }
                http
            }
        }
    }
}

/// Long-running responses go back as a short event stream: one `message`
/// frame with the envelope, then `done`.
fn stream_response(session: &Arc<Session>, response: JsonRpcResponse) -> Response {
    let seq = session.send_event("message", encode(&response));
    let frames = vec![
        Ok::<Event, Infallible>(
            Event::default()
                .id(seq.to_string())
                .event("message")
                .data(encode(&response)),
        ),
        Ok(Event::default().event("done").data("")),
    ];
    let mut http = Sse::new(futures::stream::iter(frames)).into_response();
    if let Ok(value) = HeaderValue::from_str(session.id.as_str()) {
        http.headers_mut().insert(MCP_SESSION_HEADER, value);
    }
    http
}

// --------------------------------------------------------------- CORS

fn preflight_response(route: &Arc<CompiledRoute>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(route, response.headers_mut());
    response
}

fn with_cors(route: &Arc<CompiledRoute>, mut response: Response) -> Response {
    apply_cors(route, response.headers_mut());
    response
}

fn apply_cors(route: &Arc<CompiledRoute>, headers: &mut HeaderMap) {
    let Some(cors) = &route.cors else {
        return;
    };
    let origins = if cors.allow_origins.is_empty() {
        "*".to_string()
    } else {
        cors.allow_origins.join(", ")
    };
    let methods = if cors.allow_methods.is_empty() {
        "GET, POST, OPTIONS".to_string()
    } else {
        cors.allow_methods.join(", ")
    };
    let allow_headers = if cors.allow_headers.is_empty() {
        format!("Content-Type, Authorization, {MCP_SESSION_HEADER}, {LAST_EVENT_ID_HEADER}")
    } else {
        cors.allow_headers.join(", ")
    };

    let pairs = [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, origins),
        (header::ACCESS_CONTROL_ALLOW_METHODS, methods),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if cors.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}
