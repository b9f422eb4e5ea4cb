//! The MCP server surface one frontend session talks to.
//!
//! An endpoint answers `initialize`, `ping` and `logging/setLevel` itself and routes the
//! capability methods through the [`Aggregator`] within its [`Scope`].

use crate::aggregator::{Aggregator, Scope, qualify};
use crate::connection::BackendEvent;
use crate::error::AggregatorError;
use crate::protocol::{CapabilityKind, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, severity};
use parking_lot::RwLock;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientJsonRpcMessage, ClientNotification,
    ClientRequest, Content, CustomRequest, ErrorCode, ErrorData, Implementation, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingLevel,
    LoggingMessageNotification, LoggingMessageNotificationParam,
    PromptListChangedNotification, ProtocolVersion, ResourceListChangedNotification,
    ResourceUpdatedNotification, ResourceUpdatedNotificationParam, ServerCapabilities,
    ServerJsonRpcMessage, ServerNotification, ServerResult, ToolListChangedNotification,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const SERVER_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Methods answered here. A request naming one of these whose params do not decode is
/// an invalid-params error rather than an unknown method.
const HANDLED_METHODS: &[&str] = &[
    "initialize",
    "ping",
    "logging/setLevel",
    "tools/list",
    "tools/call",
    "prompts/list",
    "prompts/get",
    "resources/list",
    "resources/templates/list",
    "resources/read",
    "resources/subscribe",
    "resources/unsubscribe",
    "completion/complete",
];

pub struct FrontendEndpoint {
    session_id: String,
    aggregator: Arc<Aggregator>,
    scope: Scope,
    log_level: RwLock<LoggingLevel>,
    initialized: AtomicBool,
    closed: AtomicBool,
    client_info: RwLock<Option<Implementation>>,
}

impl FrontendEndpoint {
    pub fn new(session_id: impl Into<String>, aggregator: Arc<Aggregator>, scope: Scope) -> Self {
        Self {
            session_id: session_id.into(),
            aggregator,
            scope,
            log_level: RwLock::new(LoggingLevel::Info),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            client_info: RwLock::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// True once the client has sent `notifications/initialized`.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually closed the endpoint.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Handle one client message. Requests always produce a reply; notifications and
    /// client responses never do.
    pub async fn handle(&self, message: ClientJsonRpcMessage) -> Option<ServerJsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(JsonRpcRequest { id, request, .. }) => {
                let method = request.method().to_string();
                let start = Instant::now();
                match self.dispatch(request).await {
                    Ok(result) => {
                        tracing::debug!(
                            mcp_session_id = %self.session_id,
                            request_id = %id,
                            method = %method,
                            elapsed = ?start.elapsed(),
                            "request ok"
                        );
                        Some(ServerJsonRpcMessage::response(result, id))
                    }
                    Err(error) => {
                        tracing::debug!(
                            mcp_session_id = %self.session_id,
                            request_id = %id,
                            method = %method,
                            code = error.code.0,
                            error = %error.message,
                            elapsed = ?start.elapsed(),
                            "request failed"
                        );
                        Some(ServerJsonRpcMessage::error(error, id))
                    }
                }
            }
            JsonRpcMessage::Notification(JsonRpcNotification { notification, .. }) => {
                match notification {
                    ClientNotification::InitializedNotification(_) => {
                        self.initialized.store(true, Ordering::Release);
                        tracing::info!(mcp_session_id = %self.session_id, "client initialized");
                    }
                    ClientNotification::CustomNotification(custom) => {
                        tracing::debug!(mcp_session_id = %self.session_id, method = %custom.method, "client notification");
                    }
                    _ => {
                        tracing::debug!(mcp_session_id = %self.session_id, "client notification");
                    }
                }
                None
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                tracing::debug!(mcp_session_id = %self.session_id, "ignoring client response");
                None
            }
        }
    }

    async fn dispatch(&self, request: ClientRequest) -> Result<ServerResult, ErrorData> {
        if self.is_closed() {
            return Err(ErrorData::invalid_request("session is closed", None));
        }
        let scope = &self.scope;
        let aggregator = &self.aggregator;

        match request {
            ClientRequest::InitializeRequest(request) => {
                let params = request.params;
                Ok(ServerResult::InitializeResult(self.initialize(
                    Some(params.protocol_version),
                    Some(params.client_info),
                )))
            }
            ClientRequest::PingRequest(_) => Ok(ServerResult::empty(())),
            ClientRequest::SetLevelRequest(request) => {
                *self.log_level.write() = request.params.level;
                Ok(ServerResult::empty(()))
            }
            ClientRequest::ListToolsRequest(_) => {
                let tools = aggregator.list_tools_in(scope);
                Ok(ServerResult::ListToolsResult(ListToolsResult::with_all_items(
                    tools.iter().map(|t| t.exposed(scope)).collect(),
                )))
            }
            ClientRequest::ListPromptsRequest(_) => {
                let prompts = aggregator.list_prompts_in(scope);
                Ok(ServerResult::ListPromptsResult(
                    ListPromptsResult::with_all_items(
                        prompts.iter().map(|p| p.exposed(scope)).collect(),
                    ),
                ))
            }
            ClientRequest::ListResourcesRequest(_) => {
                let resources = aggregator.list_resources_in(scope);
                Ok(ServerResult::ListResourcesResult(
                    ListResourcesResult::with_all_items(
                        resources.iter().map(|r| r.exposed(scope)).collect(),
                    ),
                ))
            }
            ClientRequest::ListResourceTemplatesRequest(_) => {
                Ok(ServerResult::ListResourceTemplatesResult(
                    ListResourceTemplatesResult::with_all_items(Vec::new()),
                ))
            }
            ClientRequest::CallToolRequest(request) => self
                .call_tool(request.params)
                .await
                .map(ServerResult::CallToolResult),
            ClientRequest::GetPromptRequest(request) => aggregator
                .get_prompt_in(scope, &request.params.name, request.params.arguments)
                .await
                .map(ServerResult::GetPromptResult)
                .map_err(|e| e.to_error_data()),
            ClientRequest::ReadResourceRequest(request) => aggregator
                .read_resource_in(scope, &request.params.uri)
                .await
                .map(ServerResult::ReadResourceResult)
                .map_err(|e| e.to_error_data()),
            ClientRequest::SubscribeRequest(request) => aggregator
                .subscribe_resource_in(scope, &request.params.uri)
                .await
                .map(ServerResult::empty)
                .map_err(|e| e.to_error_data()),
            ClientRequest::UnsubscribeRequest(request) => aggregator
                .unsubscribe_resource_in(scope, &request.params.uri)
                .await
                .map(ServerResult::empty)
                .map_err(|e| e.to_error_data()),
            ClientRequest::CompleteRequest(request) => aggregator
                .complete_in(scope, request.params)
                .await
                .map(ServerResult::CompleteResult)
                .map_err(|e| e.to_error_data()),
            ClientRequest::CustomRequest(request) => self.custom(request),
        }
    }

    /// Lookup failures are protocol errors; anything that goes wrong on the backend is
    /// reported inside the tool result.
    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult, ErrorData> {
        match self
            .aggregator
            .call_tool_in(&self.scope, &params.name, params.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(e @ (AggregatorError::NotFound { .. } | AggregatorError::ServerUnavailable(_))) => {
                Err(e.to_error_data())
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Error: {e}"
            ))])),
        }
    }

    /// Requests that did not decode as a known MCP request.
    fn custom(&self, request: CustomRequest) -> Result<ServerResult, ErrorData> {
        let method = request.method.as_str();
        if method == "initialize" {
            // Clients that leave out capabilities or clientInfo still get a session.
            let params = request.params.as_ref();
            let version = params
                .and_then(|p| p.get("protocolVersion"))
                .and_then(|v| serde_json::from_value::<ProtocolVersion>(v.clone()).ok());
            let client_info = params
                .and_then(|p| p.get("clientInfo"))
                .and_then(|v| serde_json::from_value::<Implementation>(v.clone()).ok());
            return Ok(ServerResult::InitializeResult(
                self.initialize(version, client_info),
            ));
        }
        if HANDLED_METHODS.contains(&method) {
            return Err(ErrorData::invalid_params(
                format!("invalid params for {method}"),
                None,
            ));
        }
        Err(ErrorData::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
            None,
        ))
    }

    fn initialize(
        &self,
        requested: Option<ProtocolVersion>,
        client_info: Option<Implementation>,
    ) -> InitializeResult {
        let protocol_version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(PROTOCOL_VERSION);
        *self.client_info.write() = client_info;

        let instructions = match &self.scope {
            Scope::Merged => "Capabilities of every connected server. Names are qualified as \
                              `server:name`; unqualified names resolve to the first server \
                              that provides them."
                .to_string(),
            Scope::Single(server) => format!("Capabilities of the `{server}` server."),
        };

        tracing::info!(
            mcp_session_id = %self.session_id,
            protocol_version = %protocol_version,
            scope = ?self.scope,
            "session initializing"
        );

        InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_completions()
                .enable_prompts()
                .enable_prompts_list_changed()
                .enable_resources()
                .enable_resources_list_changed()
                .enable_resources_subscribe()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: VERSION.to_string(),
                ..Implementation::default()
            },
            instructions: Some(instructions),
        }
    }

    /// Render a backend event as a notification for this session, if it should see it.
    pub fn render_event(&self, event: &BackendEvent) -> Option<ServerJsonRpcMessage> {
        if self.is_closed() || !self.scope.includes(event.server()) {
            return None;
        }
        let notification = match event {
            BackendEvent::ListChanged { kind, .. } => match kind {
                CapabilityKind::Tool => ServerNotification::ToolListChangedNotification(
                    ToolListChangedNotification::default(),
                ),
                CapabilityKind::Prompt => ServerNotification::PromptListChangedNotification(
                    PromptListChangedNotification::default(),
                ),
                CapabilityKind::Resource => ServerNotification::ResourceListChangedNotification(
                    ResourceListChangedNotification::default(),
                ),
            },
            BackendEvent::Log {
                server,
                level,
                logger,
                data,
            } => {
                if severity(*level) < severity(*self.log_level.read()) {
                    return None;
                }
                ServerNotification::LoggingMessageNotification(LoggingMessageNotification::new(
                    LoggingMessageNotificationParam {
                        level: *level,
                        logger: Some(logger.clone().unwrap_or_else(|| server.clone())),
                        data: data.clone(),
                    },
                ))
            }
            BackendEvent::ResourceUpdated { server, uri } => {
                let uri = match &self.scope {
                    Scope::Merged => qualify(server, uri),
                    Scope::Single(_) => uri.clone(),
                };
                ServerNotification::ResourceUpdatedNotification(ResourceUpdatedNotification::new(
                    ResourceUpdatedNotificationParam { uri },
                ))
            }
        };
        Some(ServerJsonRpcMessage::notification(notification))
    }
}
