//! HTTP + server-sent-events client transport.
//!
//! The event stream is a long-lived GET; the server's first `endpoint`
//! event names the URL that JSON-RPC requests are POSTed to. Responses
//! come back over the event stream and are correlated by request id, so
//! concurrent requests are fine on this transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::core::{
    initialize_params, parse_server_info, route_response_line, OutboundTransport, TransportError,
    TransportResult, DEFAULT_REQUEST_TIMEOUT,
};
use crate::sse_codec::SseDecoder;
use omnigate_core::RequestId;
use omnigate_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use omnigate_protocol::types::Implementation;
use omnigate_template::{RenderContext, Template};

/// Configuration for an SSE transport.
#[derive(Debug, Clone)]
pub struct SseTransportConfig {
    /// Event-stream URL
    pub url: String,
    /// Header templates sent on both the stream GET and request POSTs
    pub headers: BTreeMap<String, String>,
    /// Deadline for stream connect + `endpoint` event + handshake
    pub connect_timeout: Duration,
    /// Per-request deadline
    pub request_timeout: Duration,
}

impl Default for SseTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct RunningSse {
    stream_task: tokio::task::JoinHandle<()>,
    headers: HeaderMap,
}

/// SSE MCP transport.
pub struct SseTransport {
    config: SseTransportConfig,
    http: reqwest::Client,
    running: Mutex<Option<RunningSse>>,
    pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicI64,
    endpoint_tx: watch::Sender<Option<String>>,
    server_info: Mutex<Option<Implementation>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.config.url)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SseTransport {
    /// Create a transport; nothing connects until [`OutboundTransport::start`].
    #[must_use]
    pub fn new(config: SseTransportConfig) -> Self {
        let (endpoint_tx, _) = watch::channel(None);
        Self {
            config,
            http: reqwest::Client::new(),
            running: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
            endpoint_tx,
            server_info: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint_tx.borrow().clone()
    }

    fn request_headers(&self) -> TransportResult<HeaderMap> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.headers.clone())
            .ok_or(TransportError::NotRunning)
    }

    async fn open_stream(&self, headers: HeaderMap) -> TransportResult<()> {
        let response = self
            .http
            .get(&self.config.url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let base = url::Url::parse(&self.config.url).map_err(|e| {
            TransportError::ConnectionFailed(format!("bad url '{}': {e}", self.config.url))
        })?;
        let pending = Arc::clone(&self.pending);
        let endpoint_tx = self.endpoint_tx.clone();
        let stream_task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let Ok(chunk) = chunk else {
                    warn!("sse stream read failed");
                    break;
                };
                for event in decoder.feed(&chunk) {
                    match event.name() {
                        "endpoint" => {
                            let endpoint = match base.join(event.data.trim()) {
                                Ok(url) => url.to_string(),
                                Err(_) => event.data.trim().to_string(),
                            };
                            debug!(%endpoint, "sse endpoint advertised");
                            let _ = endpoint_tx.send(Some(endpoint));
                        }
                        "message" => route_response_line(&pending, &event.data),
                        other => trace!(event = other, "unhandled sse event"),
                    }
                }
            }
            debug!("sse stream ended");
            let _ = endpoint_tx.send(None);
            pending.clear();
        });

        *self.running.lock() = Some(RunningSse {
            stream_task,
            headers,
        });
        Ok(())
    }

    async fn wait_for_endpoint(&self) -> TransportResult<String> {
        let mut rx = self.endpoint_tx.subscribe();
        loop {
            if let Some(endpoint) = rx.borrow_and_update().clone() {
                return Ok(endpoint);
            }
            rx.changed().await.map_err(|_| {
                TransportError::ConnectionFailed("stream closed before endpoint event".to_string())
            })?;
        }
    }

    async fn exchange(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let endpoint = self
            .endpoint()
            .ok_or(TransportError::NotRunning)?;
        let headers = self.request_headers()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, RequestId::Number(id));

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let post = self
            .http
            .post(&endpoint)
            .headers(headers)
            .json(&request)
            .send()
            .await;
        match post {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                self.pending.remove(&id);
                return Err(TransportError::Protocol(format!(
                    "message endpoint returned {}",
                    response.status()
                )));
            }
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        }

        let response = match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(TransportError::ConnectionLost(
                    "stream closed mid-request".to_string(),
                ));
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(TransportError::Timeout);
            }
        };
        match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(error)) => Err(TransportError::from_rpc_error(error)),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Render header templates into a reqwest header map.
pub(crate) fn render_headers(
    templates: &BTreeMap<String, String>,
    tmpl: &RenderContext,
) -> TransportResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value_template) in templates {
        let rendered = Template::parse(value_template)
            .map_err(|e| TransportError::ConnectionFailed(format!("header '{name}': {e}")))?
            .render(tmpl)
            .map_err(|e| TransportError::ConnectionFailed(format!("header '{name}': {e}")))?;
        if rendered.is_empty() {
            continue;
        }
        let header_name: HeaderName = name
            .parse()
            .map_err(|_| TransportError::ConnectionFailed(format!("bad header name '{name}'")))?;
        let header_value = HeaderValue::from_str(&rendered).map_err(|_| {
            TransportError::ConnectionFailed(format!("bad header value for '{name}'"))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

#[async_trait]
impl OutboundTransport for SseTransport {
    async fn start(&self, tmpl: &RenderContext) -> TransportResult<()> {
        if self.is_running() {
            return Ok(());
        }
        info!(url = %self.config.url, "starting sse backend");
        let headers = render_headers(&self.config.headers, tmpl)?;

        let startup = async {
            self.open_stream(headers).await?;
            self.wait_for_endpoint().await?;
            let result = self.exchange("initialize", Some(initialize_params())).await?;
            *self.server_info.lock() = parse_server_info(&result);
            self.notify(omnigate_protocol::methods::INITIALIZED, None).await
        };
        match timeout(self.config.connect_timeout, startup).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop().await.ok();
                Err(e)
            }
            Err(_) => {
                self.stop().await.ok();
                Err(TransportError::ConnectionFailed(
                    "sse startup timed out".to_string(),
                ))
            }
        }
    }

    async fn stop(&self) -> TransportResult<()> {
        if let Some(running) = self.running.lock().take() {
            running.stream_task.abort();
        }
        let _ = self.endpoint_tx.send(None);
        self.pending.clear();
        *self.server_info.lock() = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn server_info(&self) -> Option<Implementation> {
        self.server_info.lock().clone()
    }

    async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.exchange(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        let endpoint = self.endpoint().ok_or(TransportError::NotRunning)?;
        let headers = self.request_headers()?;
        let notification = JsonRpcNotification::new(method, params);
        let response = self
            .http
            .post(&endpoint)
            .headers(headers)
            .json(&notification)
            .send()
            .await?;
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

    #[test]
    fn header_rendering_skips_empty_values() {
        let mut templates = BTreeMap::new();
        templates.insert("Authorization".to_string(), "{{.Config.token}}".to_string());
        templates.insert("X-Static".to_string(), "fixed".to_string());

        // No token in the context: Authorization is omitted entirely.
        let headers = render_headers(&templates, &RenderContext::default()).unwrap();
        assert!(headers.get("authorization").is_none());
        assert_eq!(headers.get("x-static").unwrap(), "fixed");

        let mut ctx = RenderContext::default();
        ctx.config.insert("token".into(), "Bearer abc".into());
        let headers = render_headers(&templates, &ctx).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn request_before_start_is_rejected() {
        let transport = SseTransport::new(SseTransportConfig::default());
        let err = transport
            .request("tools/list", Some(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotRunning));
    }
}
