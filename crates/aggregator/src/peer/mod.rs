//! Client side of one backend MCP connection.
//!
//! A [`PeerHandle`] wraps an rmcp client session running over the backend's stdio. The
//! initialize handshake happens in [`PeerHandle::connect`]; notifications from the backend
//! are handed to whoever holds the [`Notifications`] receiver returned alongside it.

mod client;
mod transport;

pub use client::{Notifications, PeerNotification};

use crate::config::BackendDescriptor;
use crate::protocol::JsonObject;
use client::BackendClient;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientRequest, CompleteRequestParam, CompleteResult,
    CustomRequest, CustomResult, GetPromptRequestParam, GetPromptResult, InitializeResult, Prompt,
    ReadResourceRequestParam, ReadResourceResult, Resource, ServerResult, SubscribeRequestParam,
    Tool, UnsubscribeRequestParam,
};
use rmcp::service::{Peer, PeerRequestOptions, RunningService, ServiceError};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use transport::LineTransport;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to spawn backend: {0}")]
    Spawn(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("connection closed")]
    Closed,

    #[error("backend error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The backend replied, but the reply does not match the expected result shape.
    #[error("{method} result failed validation: {details}")]
    Validation { method: String, details: String },
}

impl PeerError {
    fn from_service(method: &str, error: ServiceError) -> Self {
        match error {
            ServiceError::McpError(e) => Self::Rpc {
                code: e.code.0,
                message: e.message.into_owned(),
                data: e.data,
            },
            ServiceError::UnexpectedResponse => Self::Validation {
                method: method.to_string(),
                details: "result does not match the expected shape".to_string(),
            },
            ServiceError::Timeout { timeout } => Self::Timeout {
                method: method.to_string(),
                after: timeout,
            },
            other => {
                tracing::debug!(method, error = %other, "backend request ended without a reply");
                Self::Closed
            }
        }
    }
}

type Session = RunningService<RoleClient, BackendClient>;

pub struct PeerHandle {
    name: String,
    peer: Peer<RoleClient>,
    session: AsyncMutex<Option<Session>>,
    closed: CancellationToken,
    child: parking_lot::Mutex<Option<Child>>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Run the `initialize` handshake over an already-open byte stream.
    pub async fn connect<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
    ) -> Result<(Arc<Self>, Notifications), PeerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let closed = CancellationToken::new();
        let transport = LineTransport::new(&name, reader, writer, closed.clone());
        let (client, notifications) = BackendClient::new();

        let session = client
            .serve(transport)
            .await
            .map_err(|e| PeerError::Handshake(e.to_string()))?;

        let handle = Arc::new(Self {
            name,
            peer: session.peer().clone(),
            session: AsyncMutex::new(Some(session)),
            closed,
            child: parking_lot::Mutex::new(None),
        });
        Ok((handle, notifications))
    }

    /// Launch the backend as a child process and connect over its stdio.
    ///
    /// The child's stderr is inherited. Dropping the returned future before the handshake
    /// completes kills the child.
    pub async fn spawn_stdio(
        descriptor: &BackendDescriptor,
    ) -> Result<(Arc<Self>, Notifications), PeerError> {
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PeerError::Spawn(format!("{}: {e}", descriptor.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PeerError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PeerError::Spawn("child stdout unavailable".to_string()))?;

        tracing::debug!(
            server = %descriptor.name,
            command = %descriptor.command,
            pid = ?child.id(),
            "spawned backend process"
        );

        let (peer, notifications) = Self::connect(&descriptor.name, stdout, stdin).await?;
        *peer.child.lock() = Some(child);
        Ok((peer, notifications))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend's `initialize` result.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.peer.peer_info().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.peer.is_transport_closed()
    }

    /// Resolves once the backend's output has ended or the handle was closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, PeerError> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| PeerError::from_service("tools/list", e))
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, PeerError> {
        self.peer
            .list_all_prompts()
            .await
            .map_err(|e| PeerError::from_service("prompts/list", e))
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, PeerError> {
        self.peer
            .list_all_resources()
            .await
            .map_err(|e| PeerError::from_service("resources/list", e))
    }

    /// Call a tool and validate the reply against the canonical result shape.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, PeerError> {
        self.peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| PeerError::from_service("tools/call", e))
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, PeerError> {
        self.peer
            .get_prompt(GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            })
            .await
            .map_err(|e| PeerError::from_service("prompts/get", e))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, PeerError> {
        self.peer
            .read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| PeerError::from_service("resources/read", e))
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), PeerError> {
        self.peer
            .subscribe(SubscribeRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| PeerError::from_service("resources/subscribe", e))
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), PeerError> {
        self.peer
            .unsubscribe(UnsubscribeRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| PeerError::from_service("resources/unsubscribe", e))
    }

    pub async fn complete(&self, params: CompleteRequestParam) -> Result<CompleteResult, PeerError> {
        self.peer
            .complete(params)
            .await
            .map_err(|e| PeerError::from_service("completion/complete", e))
    }

    /// Send a request and return the reply without validating its shape, giving up after
    /// `timeout`.
    ///
    /// The request gets its own id on the session. Abandoning the wait sends a
    /// cancellation to the backend and discards any late reply, so later requests on this
    /// connection are unaffected.
    pub async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, PeerError> {
        let request = ClientRequest::CustomRequest(CustomRequest::new(method, params));
        let options = PeerRequestOptions {
            timeout: Some(timeout),
            meta: None,
        };
        let result = self
            .peer
            .send_request_with_option(request, options)
            .await
            .map_err(|e| PeerError::from_service(method, e))?
            .await_response()
            .await
            .map_err(|e| PeerError::from_service(method, e))?;

        match result {
            ServerResult::CustomResult(CustomResult(value)) => Ok(value),
            typed => serde_json::to_value(typed).map_err(|e| PeerError::Validation {
                method: method.to_string(),
                details: e.to_string(),
            }),
        }
    }

    /// Stop the session and terminate the child. Idempotent.
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return;
        };
        if let Err(e) = session.cancel().await {
            tracing::debug!(server = %self.name, error = %e, "session task ended abnormally");
        }
        self.closed.cancel();

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.name, error = %e, "backend process already gone");
            }
        }
        tracing::debug!(server = %self.name, "peer closed");
    }
}

/// `tools/call` parameters as sent on the wire.
pub(crate) fn tool_call_params(name: &str, arguments: Option<JsonObject>) -> Value {
    let mut params = JsonObject::new();
    params.insert("name".to_string(), Value::from(name));
    if let Some(arguments) = arguments {
        params.insert("arguments".to_string(), Value::Object(arguments));
    }
    Value::Object(params)
}
