//! The gateway instance: backend connections, aggregation, the event log and both
//! frontend session registries, with an explicit start/shutdown lifecycle.

use crate::aggregator::Aggregator;
use crate::config::{BackendDescriptor, GatewaySettings};
use crate::connection::{ConnectSummary, ConnectionManager, Connector, StdioConnector};
use crate::session::{InMemoryEventStore, PushTransport, SessionRegistry, StreamableTransport};
use crate::{http, session};
use axum::Router;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub struct Gateway {
    settings: GatewaySettings,
    connections: Arc<ConnectionManager>,
    aggregator: Arc<Aggregator>,
    event_store: Arc<InMemoryEventStore>,
    sse_sessions: Arc<SessionRegistry<PushTransport>>,
    http_sessions: Arc<SessionRegistry<StreamableTransport>>,
    session_ids: SessionIdGenerator,
    started_at: Instant,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl Gateway {
    /// A gateway that launches its backends as stdio subprocesses.
    pub fn new(settings: GatewaySettings, servers: Vec<BackendDescriptor>) -> Self {
        Self::with_connector(settings, servers, Arc::new(StdioConnector))
    }

    pub fn with_connector(
        settings: GatewaySettings,
        servers: Vec<BackendDescriptor>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            servers,
            settings.startup_timeout_duration(),
            connector,
        ));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&connections)));
        Self {
            settings,
            connections,
            aggregator,
            event_store: Arc::new(InMemoryEventStore::new()),
            sse_sessions: Arc::new(SessionRegistry::new("sse")),
            http_sessions: Arc::new(SessionRegistry::new("streamable-http")),
            session_ids: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replace the session id source.
    #[must_use]
    pub fn with_session_ids(mut self, generator: SessionIdGenerator) -> Self {
        self.session_ids = generator;
        self
    }

    /// Connect every configured backend and start expiring idle streamable sessions.
    /// Individual backend failures are logged and skipped.
    pub async fn start(&self) -> ConnectSummary {
        if let Some(idle) = self.settings.session_idle_timeout_duration() {
            self.http_sessions
                .spawn_idle_sweeper(idle, self.shutdown.clone());
        }
        let summary = self.connections.connect_all().await;
        if summary.connected.is_empty() && !self.connections.descriptors().is_empty() {
            tracing::warn!("no backend connected; the gateway will serve empty listings");
        }
        summary
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .merge(http::router(Arc::clone(self)))
            .merge(session::sse::router(Arc::clone(self)))
            .merge(session::streamable::router(Arc::clone(self)))
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn event_store(&self) -> &Arc<InMemoryEventStore> {
        &self.event_store
    }

    pub fn sse_sessions(&self) -> &Arc<SessionRegistry<PushTransport>> {
        &self.sse_sessions
    }

    pub fn http_sessions(&self) -> &Arc<SessionRegistry<StreamableTransport>> {
        &self.http_sessions
    }

    pub fn new_session_id(&self) -> String {
        (self.session_ids)()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Cancelled once [`Gateway::shutdown`] begins; drives the HTTP server's graceful exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Close all sessions, disconnect all backends, clear the event log. Runs once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let sse = self.sse_sessions.close_all();
        let http = self.http_sessions.close_all();
        self.connections.disconnect_all().await;
        self.event_store.clear();
        tracing::info!(sse_sessions = sse, http_sessions = http, "gateway stopped");
    }
}
