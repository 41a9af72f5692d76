//! Streamable-HTTP client transport.
//!
//! One endpoint, one POST per JSON-RPC exchange. The server assigns an
//! `Mcp-Session-Id` on the first response and the client echoes it on
//! every later request. A response arrives either as a single JSON
//! envelope or as a short event stream, selected by `Content-Type`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::core::{
    initialize_params, parse_server_info, OutboundTransport, TransportError, TransportResult,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::sse_codec::SseDecoder;
use crate::sse_transport::render_headers;
use omnigate_core::RequestId;
use omnigate_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use omnigate_protocol::types::Implementation;
use omnigate_template::RenderContext;

/// Session header shared by both streamable sides of the gateway.
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// Configuration for a streamable-HTTP transport.
#[derive(Debug, Clone)]
pub struct StreamableTransportConfig {
    /// Endpoint URL
    pub url: String,
    /// Header templates
    pub headers: BTreeMap<String, String>,
    /// Deadline for the initialize handshake
    pub connect_timeout: Duration,
    /// Per-request deadline
    pub request_timeout: Duration,
}

impl Default for StreamableTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Streamable-HTTP MCP transport.
pub struct StreamableTransport {
    config: StreamableTransportConfig,
    http: reqwest::Client,
    rendered_headers: Mutex<Option<HeaderMap>>,
    session_id: Mutex<Option<String>>,
    server_info: Mutex<Option<Implementation>>,
    next_id: AtomicI64,
}

impl std::fmt::Debug for StreamableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableTransport")
            .field("url", &self.config.url)
            .field("running", &self.is_running())
            .finish()
    }
}

impl StreamableTransport {
    /// Create a transport; nothing connects until [`OutboundTransport::start`].
    #[must_use]
    pub fn new(config: StreamableTransportConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            rendered_headers: Mutex::new(None),
            session_id: Mutex::new(None),
            server_info: Mutex::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    fn base_headers(&self) -> TransportResult<HeaderMap> {
        let mut headers = self
            .rendered_headers
            .lock()
            .clone()
            .ok_or(TransportError::NotRunning)?;
        if let Some(session) = self.session_id.lock().as_deref() {
            if let Ok(value) = session.parse() {
                headers.insert(MCP_SESSION_HEADER, value);
            }
        }
        Ok(headers)
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session) = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock();
            if slot.as_deref() != Some(session) {
                debug!(%session, "streamable backend assigned session");
                *slot = Some(session.to_string());
            }
        }
    }

    async fn exchange(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, RequestId::Number(id));

        let response = self
            .http
            .post(&self.config.url)
            .headers(self.base_headers()?)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&request)
            .send()
            .await?;
        self.capture_session(&response);

        if !response.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let rpc_response = if content_type.starts_with("text/event-stream") {
            Self::read_stream_response(response, id).await?
        } else {
            response.json::<JsonRpcResponse>().await?
        };

        match (rpc_response.result, rpc_response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(error)) => Err(TransportError::from_rpc_error(error)),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Drain an event-stream response body until the envelope answering
    /// `id` (or a `done` marker) arrives.
    async fn read_stream_response(
        response: reqwest::Response,
        id: i64,
    ) -> TransportResult<JsonRpcResponse> {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in decoder.feed(&chunk) {
                match event.name() {
                    "message" => {
                        let Ok(envelope) = serde_json::from_str::<JsonRpcResponse>(&event.data)
                        else {
                            trace!("non-response frame in streamable body");
                            continue;
                        };
                        if envelope.id == Some(RequestId::Number(id)) {
                            return Ok(envelope);
                        }
                    }
                    "done" => {
                        return Err(TransportError::Protocol(
                            "stream finished without a response".to_string(),
                        ));
                    }
                    other => trace!(event = other, "unhandled streamable frame"),
                }
            }
        }
        Err(TransportError::ConnectionLost(
            "stream ended without a response".to_string(),
        ))
    }
}

#[async_trait]
impl OutboundTransport for StreamableTransport {
    async fn start(&self, tmpl: &RenderContext) -> TransportResult<()> {
        if self.is_running() {
            return Ok(());
        }
        info!(url = %self.config.url, "starting streamable backend");
        *self.rendered_headers.lock() = Some(render_headers(&self.config.headers, tmpl)?);

        let handshake = async {
            let result = self.exchange("initialize", Some(initialize_params())).await?;
            *self.server_info.lock() = parse_server_info(&result);
            self.notify(omnigate_protocol::methods::INITIALIZED, None).await
        };
        match timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop().await.ok();
                Err(e)
            }
            Err(_) => {
                self.stop().await.ok();
                Err(TransportError::ConnectionFailed(
                    "initialize handshake timed out".to_string(),
                ))
            }
        }
    }

    async fn stop(&self) -> TransportResult<()> {
        // Best-effort session teardown; the server may not support DELETE.
        let headers = self.base_headers().ok();
        let had_session = self.session_id.lock().is_some();
        if let (Some(headers), true) = (headers, had_session) {
            let _ = self.http.delete(&self.config.url).headers(headers).send().await;
        }
        *self.rendered_headers.lock() = None;
        *self.session_id.lock() = None;
        *self.server_info.lock() = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.rendered_headers.lock().is_some()
    }

    fn server_info(&self) -> Option<Implementation> {
        self.server_info.lock().clone()
    }

    async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        match timeout(self.config.request_timeout, self.exchange(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = self
            .http
            .post(&self.config.url)
            .headers(self.base_headers()?)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&notification)
            .send()
            .await?;
        self.capture_session(&response);
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!(
                "notification returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method as http_method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn initialize_result() -> Value {
        json!({
            "jsonrpc": "2.0",
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "upstream", "version": "1.0.0"}
            },
            "id": 1
        })
    }

    #[tokio::test]
    async fn start_negotiates_and_captures_session() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(MCP_SESSION_HEADER, "sess-1")
                    .set_body_json(initialize_result()),
            )
            .mount(&server)
            .await;

        let transport = StreamableTransport::new(StreamableTransportConfig {
            url: format!("{}/mcp", server.uri()),
            ..Default::default()
        });
        transport.start(&RenderContext::default()).await.unwrap();

        assert!(transport.is_running());
        assert_eq!(transport.server_info().unwrap().name, "upstream");
        assert_eq!(transport.session_id.lock().as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn session_id_is_echoed_on_later_requests() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(MCP_SESSION_HEADER, "sess-2")
                    .set_body_json(initialize_result()),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .and(header(MCP_SESSION_HEADER, "sess-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {"tools": []},
                "id": 2
            })))
            .mount(&server)
            .await;

        let transport = StreamableTransport::new(StreamableTransportConfig {
            url: format!("{}/mcp", server.uri()),
            ..Default::default()
        });
        transport.start(&RenderContext::default()).await.unwrap();
        let tools = transport.fetch_tools().await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn event_stream_responses_are_correlated() {
        let server = MockServer::start().await;
        // initialize + initialized
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(initialize_result()))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        // The actual call answers as an SSE body.
        let sse_body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]},\"id\":2}\n",
            "\n",
            "event: done\n",
            "data: {}\n",
            "\n",
        );
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = StreamableTransport::new(StreamableTransportConfig {
            url: format!("{}/mcp", server.uri()),
            ..Default::default()
        });
        transport.start(&RenderContext::default()).await.unwrap();
        let result = transport.call_tool("anything", None).await.unwrap();
        assert_eq!(result.content.len(), 1);
    }

    #[tokio::test]
    async fn upstream_rpc_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(initialize_result()))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32601, "message": "no such method"},
                "id": 2
            })))
            .mount(&server)
            .await;

        let transport = StreamableTransport::new(StreamableTransportConfig {
            url: format!("{}/mcp", server.uri()),
            ..Default::default()
        });
        transport.start(&RenderContext::default()).await.unwrap();
        let err = transport.request("tools/list", None).await.unwrap_err();
        match err {
            TransportError::Upstream { code, .. } => assert_eq!(code, -32601),
            other => panic!("unexpected error: {other}"),
        }
    }
}
