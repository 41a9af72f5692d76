//! Client session management.
//!
//! Sessions are process-local, keyed by an opaque id, and shared between
//! the SSE stream task and per-request handlers. Every session owns a
//! bounded event ring for `Last-Event-ID` resumption and a cancellation
//! token that parents all of its in-flight work: closing the session
//! cancels everything beneath it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use omnigate_core::{EventRing, RingPush, SessionId};

/// Event name emitted when the ring overflowed and a replay would gap.
pub const RESYNC_EVENT: &str = "stream-resync-required";

/// Which wire flavor the session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionProtocol {
    /// `GET /sse` + `POST /message`
    Sse,
    /// Single-endpoint streamable HTTP
    StreamableHttp,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, stream not yet attached
    Init,
    /// Stream attached and live
    Open,
    /// Stream detached; grace period running
    Closing,
    /// Gone; kept only momentarily before removal
    Closed,
}

/// One framed server-to-client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Monotonic per-session sequence (the SSE `id:` field)
    pub seq: u64,
    /// Event name (the SSE `event:` field)
    pub name: String,
    /// Event payload (the SSE `data:` field)
    pub data: String,
}

/// Replay verdict for a resuming client.
#[derive(Debug)]
pub enum Replay {
    /// Every missed event is still buffered
    Events(Vec<SessionEvent>),
    /// History is gone; the client must resync from scratch
    ResyncRequired,
}

/// A single client session.
pub struct Session {
    /// Opaque unique id
    pub id: SessionId,
    /// Owning tenant
    pub tenant: String,
    /// Router prefix the session was created under
    pub prefix: String,
    /// Wire flavor
    pub protocol: SessionProtocol,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Cancellation root for all in-flight work on this session
    pub cancel: CancellationToken,
    state: Mutex<SessionState>,
    last_seen: Mutex<Instant>,
    closing_since: Mutex<Option<Instant>>,
    ring: Mutex<EventRing<(String, String)>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    resync_pending: Mutex<bool>,
    pending_requests: Mutex<std::collections::HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Session {
    fn new(
        tenant: String,
        prefix: String,
        protocol: SessionProtocol,
        ring_capacity: usize,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            tenant,
            prefix,
            protocol,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Init),
            last_seen: Mutex::new(Instant::now()),
            closing_since: Mutex::new(None),
            ring: Mutex::new(EventRing::new(ring_capacity)),
            outbound: Mutex::new(None),
            resync_pending: Mutex::new(false),
            pending_requests: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Register an in-flight request, returning its cancellation token.
    ///
    /// The token is a child of the session token: closing the session
    /// cancels every request, while `notifications/cancelled` can target
    /// one request without touching the rest.
    pub fn begin_request(&self, request_id: &omnigate_core::RequestId) -> CancellationToken {
        let token = self.cancel.child_token();
        self.pending_requests
            .lock()
            .insert(request_id.as_log_value(), token.clone());
        token
    }

    /// Drop the tracking entry once a request completes.
    pub fn finish_request(&self, request_id: &omnigate_core::RequestId) {
        self.pending_requests
            .lock()
            .remove(&request_id.as_log_value());
    }

    /// Cancel one in-flight request by its JSON-RPC id.
    pub fn cancel_request(&self, request_id: &omnigate_core::RequestId) -> bool {
        if let Some(token) = self
            .pending_requests
            .lock()
            .remove(&request_id.as_log_value())
        {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Append an event, assign its sequence, and push it to the attached
    /// stream. Overflow drops the oldest buffered event and queues a
    /// `stream-resync-required` marker exactly once per overflow run.
    pub fn send_event(&self, name: &str, data: String) -> u64 {
        self.touch();
        let (seq, overflowed) = {
            let mut ring = self.ring.lock();
            let (seq, outcome) = ring.push((name.to_string(), data.clone()));
            (seq, matches!(outcome, RingPush::Evicted(_)))
        };
        self.forward(SessionEvent {
            seq,
            name: name.to_string(),
            data,
        });

        if overflowed {
            let mut pending = self.resync_pending.lock();
            if !*pending {
                *pending = true;
                drop(pending);
                let resync_seq = {
                    let mut ring = self.ring.lock();
                    ring.push((RESYNC_EVENT.to_string(), String::new())).0
                };
                self.forward(SessionEvent {
                    seq: resync_seq,
                    name: RESYNC_EVENT.to_string(),
                    data: String::new(),
                });
            }
        }
        seq
    }

    fn forward(&self, event: SessionEvent) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            // A dropped receiver means the stream just went away; the
            // event stays in the ring for replay.
            let _ = tx.send(event);
        }
    }

    /// Attach a live stream writer, replacing any previous one.
    ///
    /// Returns the receiver end the stream task drains.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        *self.state.lock() = SessionState::Open;
        *self.closing_since.lock() = None;
        *self.resync_pending.lock() = false;
        self.touch();
        rx
    }

    /// Detach the stream; the grace period starts now.
    ///
    /// In-flight requests are cancelled immediately: with the stream gone
    /// there is nobody to receive their results, and upstream calls must
    /// not keep running against a disconnected client.
    pub fn detach(&self) {
        *self.outbound.lock() = None;
        let mut state = self.state.lock();
        if *state == SessionState::Open {
            *state = SessionState::Closing;
        }
        drop(state);
        *self.closing_since.lock() = Some(Instant::now());
        for (_, token) in self.pending_requests.lock().drain() {
            token.cancel();
        }
    }

    /// Replay events after `last_seen_seq` for a resuming client.
    #[must_use]
    pub fn replay_after(&self, last_seen_seq: u64) -> Replay {
        let ring = self.ring.lock();
        if ring.can_resume_after(last_seen_seq) {
            let events = ring
                .replay_after(last_seen_seq)
                .into_iter()
                .map(|(seq, (name, data))| SessionEvent { seq, name, data })
                .collect();
            Replay::Events(events)
        } else {
            Replay::ResyncRequired
        }
    }

    /// Next sequence that will be assigned (test and introspection aid).
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.ring.lock().next_seq()
    }

    fn expired(&self, grace: Duration, idle_timeout: Duration) -> bool {
        if let Some(since) = *self.closing_since.lock() {
            if since.elapsed() > grace {
                return true;
            }
        }
        self.last_seen.lock().elapsed() > idle_timeout
    }

    fn close(&self) {
        *self.state.lock() = SessionState::Closed;
        self.cancel.cancel();
    }
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionRegistryConfig {
    /// Event-ring capacity per session
    pub ring_capacity: usize,
    /// How long a detached session survives before destruction
    pub disconnect_grace: Duration,
    /// Hard idle cutoff even for attached sessions
    pub idle_timeout: Duration,
    /// Reaper cadence
    pub reap_interval: Duration,
    /// Heartbeat comment cadence on SSE streams
    pub heartbeat_interval: Duration,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            disconnect_grace: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Concurrent session registry.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionRegistryConfig,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: SessionRegistryConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &SessionRegistryConfig {
        &self.config
    }

    /// Allocate a new session.
    pub fn create(
        &self,
        tenant: impl Into<String>,
        prefix: impl Into<String>,
        protocol: SessionProtocol,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            tenant.into(),
            prefix.into(),
            protocol,
            self.config.ring_capacity,
        ));
        info!(session = %session.id, tenant = %session.tenant, protocol = ?session.protocol, "session created");
        self.sessions
            .insert(session.id.as_str().to_string(), Arc::clone(&session));
        session
    }

    /// Look a session up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Destroy a session, cancelling its in-flight work.
    pub fn remove(&self, id: &str) -> bool {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.close();
            info!(session = %session.id, "session destroyed");
            true
        } else {
            false
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel everything; used on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id);
        }
    }

    fn reap(&self) {
        let grace = self.config.disconnect_grace;
        let idle = self.config.idle_timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().expired(grace, idle))
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            debug!(session = %id, "reaping expired session");
            self.remove(&id);
        }
    }

    /// Spawn the periodic reaper; runs for the registry's lifetime.
    pub fn start_reaper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap();
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionRegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionRegistryConfig::default())
    }

    #[tokio::test]
    async fn event_sequence_starts_at_one() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        assert_eq!(session.send_event("message", "a".into()), 1);
        assert_eq!(session.send_event("message", "b".into()), 2);
    }

    #[tokio::test]
    async fn attached_stream_receives_events() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        let mut rx = session.attach();
        session.send_event("message", "hello".into());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.data, "hello");
    }

    #[tokio::test]
    async fn replay_covers_disconnect_window() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        for i in 1..=10 {
            session.send_event("message", format!("e{i}"));
        }
        // Client saw 1..=5 and reconnects.
        let Replay::Events(events) = session.replay_after(5) else {
            panic!("expected replay");
        };
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
        // Sequence continues from 11 after the replay.
        assert_eq!(session.send_event("message", "next".into()), 11);
    }

    #[tokio::test]
    async fn stale_resume_requires_resync() {
        let reg = SessionRegistry::new(SessionRegistryConfig {
            ring_capacity: 4,
            ..Default::default()
        });
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        for i in 1..=20 {
            session.send_event("message", format!("e{i}"));
        }
        assert!(matches!(session.replay_after(1), Replay::ResyncRequired));
    }

    #[tokio::test]
    async fn overflow_emits_single_resync_marker() {
        let reg = SessionRegistry::new(SessionRegistryConfig {
            ring_capacity: 2,
            ..Default::default()
        });
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        let mut rx = session.attach();
        for i in 1..=5 {
            session.send_event("message", format!("e{i}"));
        }
        let mut resyncs = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name == RESYNC_EVENT {
                resyncs += 1;
            }
        }
        assert_eq!(resyncs, 1);
    }

    #[tokio::test]
    async fn removal_cancels_in_flight_work() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::StreamableHttp);
        let token = session.cancel.clone();
        assert!(!token.is_cancelled());
        let id = session.id.as_str().to_string();
        assert!(reg.remove(&id));
        assert!(token.is_cancelled());
        assert!(reg.get(&id).is_none());
    }

    #[tokio::test]
    async fn stream_disconnect_cancels_in_flight_requests() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        let _rx = session.attach();
        let token = session.begin_request(&omnigate_core::RequestId::Number(1));

        session.detach();
        assert!(token.is_cancelled());
        // The session itself survives for the grace period.
        assert!(!session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn detach_starts_grace_not_destruction() {
        let reg = registry();
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        let _rx = session.attach();
        assert_eq!(session.state(), SessionState::Open);
        session.detach();
        assert_eq!(session.state(), SessionState::Closing);
        // Still resolvable during grace.
        assert!(reg.get(session.id.as_str()).is_some());
    }

    #[tokio::test]
    async fn reaper_removes_expired_sessions() {
        let reg = Arc::new(SessionRegistry::new(SessionRegistryConfig {
            disconnect_grace: Duration::from_millis(0),
            ..Default::default()
        }));
        let session = reg.create("t", "/t/a", SessionProtocol::Sse);
        session.detach();
        tokio::time::sleep(Duration::from_millis(5)).await;
        reg.reap();
        assert!(reg.is_empty());
    }
}
