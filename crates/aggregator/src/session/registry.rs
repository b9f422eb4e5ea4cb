//! Session bookkeeping shared by both frontend transports.

use super::endpoint::FrontendEndpoint;
use crate::connection::BackendEvent;
use crate::protocol::error_envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rmcp::model::{ClientJsonRpcMessage, ErrorCode, ServerJsonRpcMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Floor for the idle sweep period, so tiny timeouts do not spin.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// The outbound half of a frontend session.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Push a server-initiated message to the client.
    async fn deliver(&self, message: Value);

    /// Release transport resources. Called at most once per session.
    fn close(&self);

    /// A transport with an open stream keeps its session alive regardless of traffic.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// One connected frontend client: its endpoint plus the transport that reaches it.
pub struct FrontendSession<T> {
    endpoint: FrontendEndpoint,
    transport: T,
    shutdown: CancellationToken,
    created_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
}

impl<T: SessionTransport> FrontendSession<T> {
    pub fn new(endpoint: FrontendEndpoint, transport: T) -> Self {
        Self {
            endpoint,
            transport,
            shutdown: CancellationToken::new(),
            created_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        self.endpoint.session_id()
    }

    pub fn endpoint(&self) -> &FrontendEndpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Handle a client message and return the serialized reply, if any.
    pub async fn handle(&self, message: ClientJsonRpcMessage) -> Option<Value> {
        self.touch();
        let reply = self.endpoint.handle(message).await?;
        Some(to_wire(&reply))
    }

    /// Close endpoint and transport. Only the first call has any effect.
    pub fn close(&self) -> bool {
        if !self.endpoint.close() {
            return false;
        }
        self.shutdown.cancel();
        self.transport.close();
        true
    }
}

/// Active sessions of one transport flavor, keyed by session id.
pub struct SessionRegistry<T> {
    transport: &'static str,
    sessions: RwLock<HashMap<String, Arc<FrontendSession<T>>>>,
}

impl<T: SessionTransport> SessionRegistry<T> {
    pub fn new(transport: &'static str) -> Self {
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session and start forwarding backend events to it.
    pub fn insert(&self, session: Arc<FrontendSession<T>>, events: broadcast::Receiver<BackendEvent>) {
        spawn_event_forwarder(&session, events);
        tracing::info!(
            mcp_session_id = %session.id(),
            transport = self.transport,
            scope = ?session.endpoint().scope(),
            "session opened"
        );
        self.sessions
            .write()
            .insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<FrontendSession<T>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Remove and close a session. Unknown or already-closed ids are a no-op.
    pub fn close(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        session.close();
        tracing::info!(mcp_session_id = %id, transport = self.transport, "session closed");
        true
    }

    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), transport = self.transport, "sessions closed");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Close every session without client activity for longer than `idle`.
    /// Sessions holding an open stream are left alone.
    pub fn expire_idle(&self, idle: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| !s.transport().is_streaming() && s.idle_for() > idle)
            .map(|(id, _)| id.clone())
            .collect();
        let mut closed = 0;
        for id in expired {
            if self.close(&id) {
                tracing::info!(mcp_session_id = %id, transport = self.transport, ?idle, "idle session expired");
                closed += 1;
            }
        }
        closed
    }

    /// Run [`SessionRegistry::expire_idle`] periodically until `shutdown` fires.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = (idle / 2).max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.expire_idle(idle);
            }
        })
    }
}

fn to_wire(message: &ServerJsonRpcMessage) -> Value {
    serde_json::to_value(message).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize outbound message");
        error_envelope(ErrorCode::INTERNAL_ERROR, format!("failed to serialize reply: {e}"))
    })
}

fn spawn_event_forwarder<T: SessionTransport>(
    session: &Arc<FrontendSession<T>>,
    mut events: broadcast::Receiver<BackendEvent>,
) {
    let shutdown = session.shutdown.clone();
    let session: Weak<FrontendSession<T>> = Arc::downgrade(session);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    if let Some(message) = session.endpoint().render_event(&event) {
                        session.transport().deliver(to_wire(&message)).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session fell behind on backend events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
