//! Stdio child-process transport.
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC
//! over its stdin/stdout; stderr is tee'd into the gateway log. The pipe
//! is a single lane, so outbound requests are serialized on one lock.
//! Shutdown is SIGTERM first, SIGKILL once the grace period lapses.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::core::{
    initialize_params, parse_server_info, OutboundTransport, TransportError, TransportResult,
    DEFAULT_REQUEST_TIMEOUT,
};
use omnigate_core::RequestId;
use omnigate_protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use omnigate_protocol::types::Implementation;
use omnigate_template::RenderContext;

/// Configuration for a stdio transport.
#[derive(Debug, Clone)]
pub struct StdioTransportConfig {
    /// Command to execute
    pub command: String,
    /// Arguments to pass
    pub args: Vec<String>,
    /// Extra environment for the child
    pub env: BTreeMap<String, String>,
    /// Deadline for spawn + initialize
    pub startup_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Oversized stdout lines are dropped beyond this
    pub max_line_bytes: usize,
}

impl Default for StdioTransportConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_line_bytes: 10 * 1024 * 1024,
        }
    }
}

struct Running {
    child: Child,
    stdin_tx: mpsc::Sender<String>,
    reader_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

/// Child-process MCP transport.
pub struct StdioTransport {
    config: StdioTransportConfig,
    running: Mutex<Option<Running>>,
    pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicI64,
    // One in-flight request at a time; the pipe has no multiplexing.
    pipe_lock: tokio::sync::Mutex<()>,
    server_info: Mutex<Option<Implementation>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.config.command)
            .field("running", &self.is_running())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport; nothing is spawned until [`OutboundTransport::start`].
    #[must_use]
    pub fn new(config: StdioTransportConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
            pipe_lock: tokio::sync::Mutex::new(()),
            server_info: Mutex::new(None),
        }
    }

    async fn spawn_process(&self) -> TransportResult<()> {
        if self.config.command.is_empty() {
            return Err(TransportError::ConnectionFailed(
                "command cannot be empty".to_string(),
            ));
        }
        info!(command = %self.config.command, args = ?self.config.args, "starting stdio backend");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to spawn '{}': {e}",
                self.config.command
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stdin handle".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stderr handle".to_string())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);

        let writer_task = {
            let mut writer = BufWriter::new(stdin);
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.write_all(b"\n").await.is_err()
                        || writer.flush().await.is_err()
                    {
                        error!("stdio backend stdin closed");
                        break;
                    }
                    trace!(%line, "stdio >>");
                }
            })
        };

        let reader_task = {
            let pending = Arc::clone(&self.pending);
            let max_line = self.config.max_line_bytes;
            let reader = BufReader::new(stdout);
            tokio::spawn(async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.len() > max_line {
                        warn!(bytes = line.len(), "oversized stdio line dropped");
                        continue;
                    }
                    trace!(%line, "stdio <<");
                    crate::core::route_response_line(&pending, &line);
                }
                debug!("stdio reader finished");
                // Child is gone; fail everything still in flight.
                pending.clear();
            })
        };

        let stderr_task = {
            let command = self.config.command.clone();
            let reader = BufReader::new(stderr);
            tokio::spawn(async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %command, "stderr: {line}");
                }
            })
        };

        *self.running.lock() = Some(Running {
            child,
            stdin_tx,
            reader_task,
            stderr_task,
            writer_task,
        });
        Ok(())
    }

    fn stdin_sender(&self) -> TransportResult<mpsc::Sender<String>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.stdin_tx.clone())
            .ok_or(TransportError::NotRunning)
    }

    async fn exchange(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let _pipe = self.pipe_lock.lock().await;
        let sender = self.stdin_sender()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, RequestId::Number(id));
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if sender.send(line).await.is_err() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionLost("stdin closed".to_string()));
        }

        let response = match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(TransportError::ConnectionLost(
                    "backend exited mid-request".to_string(),
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

    async fn terminate(&self, running: Running) {
        let Running {
            mut child,
            stdin_tx,
            reader_task,
            stderr_task,
            writer_task,
        } = running;
        drop(stdin_tx);

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            ) {
                warn!(pid, error = %e, "SIGTERM failed");
            }
        }

        match timeout(self.config.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "stdio backend exited"),
            Ok(Err(e)) => error!(error = %e, "waiting for stdio backend"),
            Err(_) => {
                warn!("stdio backend ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    error!(error = %e, "SIGKILL failed");
                }
            }
        }

        reader_task.abort();
        stderr_task.abort();
        writer_task.abort();
        self.pending.clear();
    }
}

#[async_trait]
impl OutboundTransport for StdioTransport {
    async fn start(&self, _tmpl: &RenderContext) -> TransportResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.spawn_process().await?;

        let handshake = async {
            let result = self.exchange("initialize", Some(initialize_params())).await?;
            *self.server_info.lock() = parse_server_info(&result);
            self.notify(omnigate_protocol::methods::INITIALIZED, None).await
        };
        match timeout(self.config.startup_timeout, handshake).await {
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
        let running = self.running.lock().take();
        if let Some(running) = running {
            self.terminate(running).await;
        }
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
        let sender = self.stdin_sender()?;
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        sender
            .send(line)
            .await
            .map_err(|_| TransportError::ConnectionLost("stdin closed".to_string()))
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.get_mut().take() {
            // kill_on_drop is set; just make it explicit.
            let _ = running.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_timeouts() {
        let config = StdioTransportConfig::default();
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn empty_command_fails_start() {
        let transport = StdioTransport::new(StdioTransportConfig::default());
        let err = transport.start(&RenderContext::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn request_on_stopped_transport_is_rejected() {
        let transport = StdioTransport::new(StdioTransportConfig::default());
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotRunning));
    }

    #[test]
    fn response_routing_matches_numeric_ids() {
        let pending = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(7i64, tx);
        crate::core::route_response_line(
            &pending,
            r#"{"jsonrpc":"2.0","result":{"ok":true},"id":7}"#,
        );
        let response = rx.try_recv().unwrap();
        assert!(response.is_success());
        assert!(pending.is_empty());
    }

    #[test]
    fn response_routing_ignores_notifications() {
        let pending: DashMap<i64, oneshot::Sender<JsonRpcResponse>> = DashMap::new();
        crate::core::route_response_line(
            &pending,
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#,
        );
        // Nothing panics, nothing routed.
        assert!(pending.is_empty());
    }
}
