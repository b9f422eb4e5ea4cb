//! Backend connection lifecycle: spawn, handshake, discovery, refresh, teardown.
//!
//! The [`ConnectionManager`] keeps connections in registration order (config file order).
//! Each connection caches its tools, prompts and resources; a per-connection task reacts
//! to `list_changed` notifications by refreshing the cache and fans backend events out to
//! frontend sessions over a broadcast channel.

use crate::config::BackendDescriptor;
use crate::error::{AggregatorError, Result};
use crate::peer::{Notifications, PeerError, PeerHandle, PeerNotification};
use crate::protocol::CapabilityKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::RwLock;
use rmcp::model::{LoggingLevel, LoggingMessageNotificationParam, Prompt, Resource, Tool};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Opens an initialized session with a backend. Stdio in production; in-memory pipes in
/// tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> std::result::Result<(Arc<PeerHandle>, Notifications), PeerError>;
}

/// Launches each backend as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> std::result::Result<(Arc<PeerHandle>, Notifications), PeerError> {
        PeerHandle::spawn_stdio(descriptor).await
    }
}

/// Something a backend did that frontend sessions may want to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    ListChanged {
        server: String,
        kind: CapabilityKind,
    },
    Log {
        server: String,
        level: LoggingLevel,
        logger: Option<String>,
        data: Value,
    },
    ResourceUpdated {
        server: String,
        uri: String,
    },
}

impl BackendEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::ListChanged { server, .. }
            | Self::Log { server, .. }
            | Self::ResourceUpdated { server, .. } => server,
        }
    }
}

// ============================================================================
// Backend connection
// ============================================================================

/// A live session with one backend plus its cached capability lists.
#[derive(Debug)]
pub struct BackendConnection {
    server_name: String,
    peer: Arc<PeerHandle>,
    active: AtomicBool,
    tools: RwLock<Vec<Tool>>,
    prompts: RwLock<Vec<Prompt>>,
    resources: RwLock<Vec<Resource>>,
    connected_at: DateTime<Utc>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl BackendConnection {
    fn new(server_name: String, peer: Arc<PeerHandle>) -> Self {
        Self {
            server_name,
            peer,
            active: AtomicBool::new(false),
            tools: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            connected_at: Utc::now(),
            last_refresh: RwLock::new(None),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn peer(&self) -> &Arc<PeerHandle> {
        &self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.peer.is_closed()
    }

    /// Mark inactive. Returns true if this call made the transition.
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().clone()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().clone()
    }

    /// Whether the cached lists contain `key` for the given capability kind.
    pub fn provides(&self, kind: CapabilityKind, key: &str) -> bool {
        match kind {
            CapabilityKind::Tool => self.tools.read().iter().any(|t| t.name == key),
            CapabilityKind::Prompt => self.prompts.read().iter().any(|p| p.name == key),
            CapabilityKind::Resource => self.resources.read().iter().any(|r| r.uri == key),
        }
    }

    /// Re-run discovery. A category the backend cannot list is cached as empty.
    pub async fn refresh(&self) {
        let (tools, prompts, resources) = tokio::join!(
            self.peer.list_tools(),
            self.peer.list_prompts(),
            self.peer.list_resources()
        );
        *self.tools.write() = self.or_empty(CapabilityKind::Tool, tools);
        *self.prompts.write() = self.or_empty(CapabilityKind::Prompt, prompts);
        *self.resources.write() = self.or_empty(CapabilityKind::Resource, resources);
        *self.last_refresh.write() = Some(Utc::now());
    }

    async fn refresh_kind(&self, kind: CapabilityKind) {
        match kind {
            CapabilityKind::Tool => {
                let tools = self.peer.list_tools().await;
                *self.tools.write() = self.or_empty(kind, tools);
            }
            CapabilityKind::Prompt => {
                let prompts = self.peer.list_prompts().await;
                *self.prompts.write() = self.or_empty(kind, prompts);
            }
            CapabilityKind::Resource => {
                let resources = self.peer.list_resources().await;
                *self.resources.write() = self.or_empty(kind, resources);
            }
        }
        *self.last_refresh.write() = Some(Utc::now());
    }

    fn or_empty<T>(&self, kind: CapabilityKind, listed: std::result::Result<Vec<T>, PeerError>) -> Vec<T> {
        listed.unwrap_or_else(|e| {
            tracing::debug!(
                server = %self.server_name,
                kind = %kind,
                error = %e,
                "listing unavailable; treating as empty"
            );
            Vec::new()
        })
    }

    async fn close(&self) {
        self.deactivate();
        self.peer.close().await;
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            name: self.server_name.clone(),
            state: if self.is_active() {
                BackendState::Active
            } else {
                BackendState::Inactive
            },
            tools: self.tools.read().len(),
            prompts: self.prompts.read().len(),
            resources: self.resources.read().len(),
            connected_at: Some(self.connected_at),
            last_refresh: *self.last_refresh.read(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Active,
    Inactive,
    Failed,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Connection manager
// ============================================================================

/// Outcome of [`ConnectionManager::connect_all`].
#[derive(Debug, Default, Clone)]
pub struct ConnectSummary {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct ConnectionManager {
    descriptors: Vec<BackendDescriptor>,
    startup_timeout: Duration,
    connector: Arc<dyn Connector>,
    connections: RwLock<Vec<Arc<BackendConnection>>>,
    failures: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<BackendEvent>,
}

impl ConnectionManager {
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        startup_timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            descriptors,
            startup_timeout,
            connector,
            connections: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    /// Whether `name` is a configured backend, connected or not.
    pub fn is_configured(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }

    /// Connect every configured backend concurrently. Each connection is installed as soon
    /// as it is ready, so one slow or failing backend never holds back the others.
    pub async fn connect_all(&self) -> ConnectSummary {
        let mut pending: FuturesUnordered<_> = self
            .descriptors
            .iter()
            .map(|d| async move { (d, self.connect_one(d).await) })
            .collect();

        let mut summary = ConnectSummary::default();
        while let Some((descriptor, result)) = pending.next().await {
            match result {
                Ok(connection) => {
                    self.install(connection);
                    summary.connected.push(descriptor.name.clone());
                }
                Err(e) => {
                    tracing::error!(server = %descriptor.name, error = %e, "backend connection failed");
                    self.failures
                        .write()
                        .insert(descriptor.name.clone(), e.to_string());
                    summary.failed.push((descriptor.name.clone(), e.to_string()));
                }
            }
        }
        summary.connected.sort_by_key(|name| self.rank(name));
        summary.failed.sort_by_key(|(name, _)| self.rank(name));
        summary
    }

    /// Spawn, handshake and discovery, all within the startup timeout.
    async fn connect_one(&self, descriptor: &BackendDescriptor) -> Result<Arc<BackendConnection>> {
        let start = Instant::now();
        let connect_err = |reason: String| AggregatorError::Connect {
            server: descriptor.name.clone(),
            reason,
        };

        let attempt = async {
            let (peer, notifications) = self.connector.connect(descriptor).await?;
            let connection = Arc::new(BackendConnection::new(descriptor.name.clone(), peer));
            connection.refresh().await;
            Ok::<_, PeerError>((connection, notifications))
        };
        // A timed-out attempt is dropped here, which tears down its session and child.
        let (connection, notifications) = tokio::time::timeout(self.startup_timeout, attempt)
            .await
            .map_err(|_| {
                connect_err(format!(
                    "startup timed out after {}s",
                    self.startup_timeout.as_secs_f64()
                ))
            })?
            .map_err(|e| connect_err(e.to_string()))?;

        spawn_notification_loop(Arc::clone(&connection), notifications, self.events.clone());
        connection.active.store(true, Ordering::Release);

        tracing::info!(
            server = %descriptor.name,
            tools = connection.tools.read().len(),
            prompts = connection.prompts.read().len(),
            resources = connection.resources.read().len(),
            elapsed = ?start.elapsed(),
            "backend connected"
        );
        Ok(connection)
    }

    fn rank(&self, name: &str) -> usize {
        self.descriptors
            .iter()
            .position(|d| d.name == name)
            .unwrap_or(usize::MAX)
    }

    /// Put `connection` in its registration slot, replacing any previous one.
    fn install(&self, connection: Arc<BackendConnection>) {
        let name = connection.server_name().to_string();
        self.failures.write().remove(&name);

        let mut connections = self.connections.write();
        connections.retain(|c| c.server_name() != name);
        let at = connections
            .iter()
            .position(|c| self.rank(c.server_name()) > self.rank(&name))
            .unwrap_or(connections.len());
        connections.insert(at, connection);
    }

    /// All connections in registration order, active or not.
    pub fn connections(&self) -> Vec<Arc<BackendConnection>> {
        self.connections.read().clone()
    }

    pub fn active_connections(&self) -> Vec<Arc<BackendConnection>> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.server_name() == name)
            .cloned()
    }

    /// Re-run discovery for one backend.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        match self.get(name) {
            Some(connection) if connection.is_active() => {
                connection.refresh().await;
                Ok(())
            }
            _ => Err(AggregatorError::ServerUnavailable(name.to_string())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        let failures = self.failures.read();
        self.descriptors
            .iter()
            .map(|d| match self.get(&d.name) {
                Some(connection) => connection.status(),
                None => BackendStatus {
                    name: d.name.clone(),
                    state: BackendState::Failed,
                    tools: 0,
                    prompts: 0,
                    resources: 0,
                    connected_at: None,
                    last_refresh: None,
                    error: failures.get(&d.name).cloned(),
                },
            })
            .collect()
    }

    /// Mark every connection inactive, then close them all concurrently.
    pub async fn disconnect_all(&self) {
        let connections = self.connections();
        for connection in &connections {
            connection.deactivate();
        }
        futures::future::join_all(connections.iter().map(|c| c.close())).await;
        tracing::info!(count = connections.len(), "all backends disconnected");
    }
}

fn spawn_notification_loop(
    connection: Arc<BackendConnection>,
    mut notifications: Notifications,
    events: broadcast::Sender<BackendEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    let Some(notification) = notification else { break };
                    let event = handle_notification(&connection, notification).await;
                    // No subscribers is fine.
                    let _ = events.send(event);
                }
                () = connection.peer.closed() => break,
            }
        }
        if connection.deactivate() {
            tracing::warn!(server = %connection.server_name(), "backend disconnected");
        }
    });
}

async fn handle_notification(
    connection: &BackendConnection,
    notification: PeerNotification,
) -> BackendEvent {
    let server = connection.server_name().to_string();
    match notification {
        PeerNotification::ListChanged(kind) => {
            connection.refresh_kind(kind).await;
            tracing::debug!(server = %server, kind = %kind, "capability list refreshed");
            BackendEvent::ListChanged { server, kind }
        }
        PeerNotification::Log(log) => {
            log_backend_message(&server, &log);
            BackendEvent::Log {
                server,
                level: log.level,
                logger: log.logger,
                data: log.data,
            }
        }
        PeerNotification::ResourceUpdated(uri) => BackendEvent::ResourceUpdated { server, uri },
    }
}

fn log_backend_message(server: &str, log: &LoggingMessageNotificationParam) {
    let logger = log.logger.as_deref().unwrap_or("");
    let data = &log.data;
    match log.level {
        LoggingLevel::Debug => tracing::debug!(server, logger, data = %data, "backend log"),
        LoggingLevel::Info | LoggingLevel::Notice => {
            tracing::info!(server, logger, data = %data, "backend log");
        }
        LoggingLevel::Warning => tracing::warn!(server, logger, data = %data, "backend log"),
        LoggingLevel::Error
        | LoggingLevel::Critical
        | LoggingLevel::Alert
        | LoggingLevel::Emergency => {
            tracing::error!(server, logger, data = %data, "backend log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeConnector, descriptor, eventually};
    use serde_json::json;

    fn manager(names: &[&str], connector: FakeConnector) -> (ConnectionManager, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        let descriptors = names.iter().map(|n| descriptor(n)).collect();
        let manager = ConnectionManager::new(
            descriptors,
            Duration::from_millis(500),
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        (manager, connector)
    }

    #[tokio::test]
    async fn one_failing_backend_does_not_block_others() {
        let connector = FakeConnector::new()
            .with("a", FakeBackend::new().with_tool("ta"))
            .with("c", FakeBackend::new().with_tool("tc"));
        let (manager, _) = manager(&["a", "b", "c"], connector);

        let summary = manager.connect_all().await;
        assert_eq!(summary.connected, ["a", "c"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "b");

        let names: Vec<_> = manager
            .active_connections()
            .iter()
            .map(|c| c.server_name().to_string())
            .collect();
        assert_eq!(names, ["a", "c"]);

        let statuses = manager.statuses();
        assert_eq!(statuses[1].state, BackendState::Failed);
        assert!(statuses[1].error.as_deref().unwrap().contains("No such file"));
    }

    #[tokio::test]
    async fn handshake_failures_and_timeouts_are_isolated() {
        let connector = FakeConnector::new()
            .with("ok", FakeBackend::new().with_tool("t"))
            .with("refuses", FakeBackend::new().failing_initialize())
            .with("hangs", FakeBackend::new().silent("initialize"));
        let (manager, _) = manager(&["ok", "refuses", "hangs"], connector);

        let summary = manager.connect_all().await;
        assert_eq!(summary.connected, ["ok"]);
        let failed: Vec<_> = summary.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, ["refuses", "hangs"]);
        assert!(summary.failed.iter().all(|(_, reason)| reason.contains("timed out")));
    }

    #[tokio::test]
    async fn hung_discovery_is_bounded_by_the_startup_timeout() {
        let connector = FakeConnector::new()
            .with("good", FakeBackend::new().with_tool("t"))
            .with("hung", FakeBackend::new().with_tool("x").silent("tools/list"));
        let (manager, _) = manager(&["good", "hung"], connector);

        let started = Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(2), manager.connect_all())
            .await
            .expect("connect_all must finish once the startup timeout has passed");
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(summary.connected, ["good"]);
        assert_eq!(summary.failed[0].0, "hung");
        assert!(summary.failed[0].1.contains("timed out"));

        let active: Vec<_> = manager
            .active_connections()
            .iter()
            .map(|c| c.server_name().to_string())
            .collect();
        assert_eq!(active, ["good"]);
        assert_eq!(manager.statuses()[1].state, BackendState::Failed);
    }

    #[tokio::test]
    async fn ready_backends_are_installed_while_others_still_start() {
        let connector = FakeConnector::new()
            .with("slow", FakeBackend::new().silent("tools/list"))
            .with("fast", FakeBackend::new().with_tool("t"));
        let (manager, _) = manager(&["slow", "fast"], connector);
        let manager = Arc::new(manager);

        let startup = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.connect_all().await }
        });
        eventually(|| manager.active_connections().len() == 1).await;
        assert!(!startup.is_finished());
        assert!(manager.get("fast").unwrap().provides(CapabilityKind::Tool, "t"));

        let summary = startup.await.unwrap();
        assert_eq!(summary.connected, ["fast"]);
        assert_eq!(summary.failed[0].0, "slow");
    }

    #[tokio::test]
    async fn unsupported_categories_default_to_empty() {
        let connector = FakeConnector::new().with(
            "a",
            FakeBackend::new()
                .with_tool("t")
                .with_prompt("p")
                .failing("prompts/list")
                .failing("resources/list"),
        );
        let (manager, _) = manager(&["a"], connector);
        manager.connect_all().await;

        let conn = manager.get("a").unwrap();
        assert!(conn.is_active());
        assert_eq!(conn.tools().len(), 1);
        assert!(conn.prompts().is_empty());
        assert!(conn.resources().is_empty());
    }

    #[tokio::test]
    async fn list_changed_refreshes_the_cache() {
        let connector = FakeConnector::new().with("a", FakeBackend::new().with_tool("old"));
        let (manager, connector) = manager(&["a"], connector);
        let mut events = manager.subscribe();
        manager.connect_all().await;

        let ctl = connector.control("a");
        ctl.set_tools(&["new1", "new2"]);
        ctl.notify("notifications/tools/list_changed", None);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BackendEvent::ListChanged {
                server: "a".to_string(),
                kind: CapabilityKind::Tool
            }
        );
        let conn = manager.get("a").unwrap();
        assert!(conn.provides(CapabilityKind::Tool, "new2"));
        assert!(!conn.provides(CapabilityKind::Tool, "old"));
    }

    #[tokio::test]
    async fn log_notifications_are_broadcast() {
        let connector = FakeConnector::new().with("a", FakeBackend::new());
        let (manager, connector) = manager(&["a"], connector);
        let mut events = manager.subscribe();
        manager.connect_all().await;

        connector.control("a").notify(
            "notifications/message",
            Some(json!({"level": "warning", "logger": "db", "data": "slow query"})),
        );
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BackendEvent::Log {
                server: "a".to_string(),
                level: LoggingLevel::Warning,
                logger: Some("db".to_string()),
                data: json!("slow query"),
            }
        );
    }

    #[tokio::test]
    async fn backend_exit_marks_connection_inactive() {
        let connector = FakeConnector::new().with("a", FakeBackend::new());
        let (manager, connector) = manager(&["a"], connector);
        manager.connect_all().await;
        assert_eq!(manager.active_connections().len(), 1);

        connector.control("a").hang_up();
        eventually(|| manager.active_connections().is_empty()).await;
        assert_eq!(manager.statuses()[0].state, BackendState::Inactive);
        assert!(matches!(
            manager.refresh("a").await,
            Err(AggregatorError::ServerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_all_closes_everything() {
        let connector = FakeConnector::new()
            .with("a", FakeBackend::new())
            .with("b", FakeBackend::new());
        let (manager, _) = manager(&["a", "b"], connector);
        manager.connect_all().await;

        manager.disconnect_all().await;
        assert!(manager.active_connections().is_empty());
        for connection in manager.connections() {
            assert!(connection.peer().is_closed());
        }
        // Second teardown is harmless.
        manager.disconnect_all().await;
    }
}
