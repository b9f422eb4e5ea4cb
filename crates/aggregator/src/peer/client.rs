use crate::protocol::{CapabilityKind, PROTOCOL_VERSION};
use rmcp::model::{
    ClientCapabilities, ClientInfo, Implementation, LoggingMessageNotificationParam,
    ResourceUpdatedNotificationParam,
};
use rmcp::service::NotificationContext;
use rmcp::{ClientHandler, RoleClient};
use tokio::sync::mpsc;

/// A server-to-client notification received from a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotification {
    ListChanged(CapabilityKind),
    Log(LoggingMessageNotificationParam),
    ResourceUpdated(String),
}

pub type Notifications = mpsc::UnboundedReceiver<PeerNotification>;

/// Client-side handler for one backend session. Pings and `roots/list` are answered by
/// rmcp's defaults; notifications are queued for the connection that owns the session.
pub(crate) struct BackendClient {
    notifications: mpsc::UnboundedSender<PeerNotification>,
}

impl BackendClient {
    pub(crate) fn new() -> (Self, Notifications) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { notifications: tx }, rx)
    }

    fn forward(&self, notification: PeerNotification) -> std::future::Ready<()> {
        // Nobody listening is fine; the session still serves requests.
        let _ = self.notifications.send(notification);
        std::future::ready(())
    }
}

impl ClientHandler for BackendClient {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: PROTOCOL_VERSION,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::default()
            },
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(PeerNotification::Log(params))
    }

    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(PeerNotification::ResourceUpdated(params.uri))
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(PeerNotification::ListChanged(CapabilityKind::Tool))
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(PeerNotification::ListChanged(CapabilityKind::Prompt))
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(PeerNotification::ListChanged(CapabilityKind::Resource))
    }
}
