//! Frontend sessions: one MCP endpoint per connected client, over either the legacy SSE
//! transport or the streamable HTTP transport.

pub mod endpoint;
pub mod event_log;
pub mod registry;
pub mod sse;
pub mod streamable;

pub use endpoint::FrontendEndpoint;
pub use event_log::{EventLogError, EventRecord, EventStore, InMemoryEventStore};
pub use registry::{FrontendSession, SessionRegistry, SessionTransport};
pub use sse::PushTransport;
pub use streamable::StreamableTransport;

use crate::aggregator::Scope;
use crate::gateway::Gateway;
use crate::protocol::error_envelope;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rmcp::model::{
    ClientJsonRpcMessage, ErrorCode, ErrorData, RequestId, ServerJsonRpcMessage,
};
use serde::Deserialize;
use serde_json::{Value, json};

pub(crate) const JSON_MIME_TYPE: &str = "application/json";
pub(crate) const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// `?server=` value selecting every backend. Also the default.
pub const MERGED_SCOPE: &str = "merged";

/// `?server=<name>` narrows a session to one backend.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ScopeQuery {
    server: Option<String>,
}

impl ScopeQuery {
    pub(crate) fn resolve(&self, gateway: &Gateway) -> Result<Scope, Response> {
        match self.server.as_deref().map(str::trim) {
            None | Some("" | MERGED_SCOPE) => Ok(Scope::Merged),
            Some(server) if gateway.connections().is_configured(server) => {
                Ok(Scope::Single(server.to_string()))
            }
            Some(server) => Err(jsonrpc_error_response(
                StatusCode::NOT_FOUND,
                ErrorCode::INVALID_PARAMS,
                format!("Unknown server: {server}"),
            )),
        }
    }
}

/// Plain HTTP response carrying a JSON-RPC error envelope with a null id.
pub(crate) fn jsonrpc_error_response(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response {
    (status, Json(error_envelope(code, message))).into_response()
}

/// Decode a POSTed body. Valid JSON of the wrong shape is answered with a JSON-RPC error
/// addressed to the message's id when one can be recovered.
pub(crate) fn parse_body(body: &[u8]) -> Result<ClientJsonRpcMessage, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::PARSE_ERROR,
            format!("Parse error: {e}"),
        )
    })?;
    let request_id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    serde_json::from_value(value).map_err(|e| match request_id {
        Some(id) => {
            let reply = ServerJsonRpcMessage::error(
                ErrorData::invalid_request(
                    "Invalid Request",
                    Some(json!({"type": "invalid-mcp-shape", "details": e.to_string()})),
                ),
                id,
            );
            (StatusCode::BAD_REQUEST, Json(reply)).into_response()
        }
        None => jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::INVALID_REQUEST,
            format!("Invalid Request: {e}"),
        ),
    })
}

/// Whether a decoded message is an `initialize` request.
pub(crate) fn is_initialize_request(message: &ClientJsonRpcMessage) -> bool {
    matches!(message, ClientJsonRpcMessage::Request(r) if r.request.method() == "initialize")
}
