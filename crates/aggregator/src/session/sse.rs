//! Legacy two-channel transport: a long-lived `GET /sse` event stream for server-to-client
//! traffic, and `POST /messages?sessionId=` for client-to-server messages.
//!
//! The first event on every stream is `endpoint`, carrying the URL to POST to. Replies to
//! POSTed requests are pushed over the stream as `message` events; the POST itself is
//! answered with `202 Accepted`.

use super::registry::{FrontendSession, SessionRegistry, SessionTransport};
use super::{FrontendEndpoint, ScopeQuery, jsonrpc_error_response, parse_body};
use crate::gateway::Gateway;
use crate::protocol::BAD_REQUEST;
use crate::timeouts::SSE_KEEP_ALIVE;
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SSE_PATH: &str = "/sse";
pub const MESSAGES_PATH: &str = "/messages";

/// Pushes events onto one open SSE response.
pub struct PushTransport {
    tx: mpsc::UnboundedSender<Event>,
    closed: CancellationToken,
}

#[async_trait]
impl SessionTransport for PushTransport {
    async fn deliver(&self, message: Value) {
        // The stream may already be gone; the guard deregisters the session then.
        let _ = self
            .tx
            .send(Event::default().event("message").data(message.to_string()));
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Deregisters the session when the response stream is dropped (client went away).
struct SessionGuard {
    registry: Arc<SessionRegistry<PushTransport>>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close(&self.id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Option<String>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(SSE_PATH, get(open_stream))
        .route(MESSAGES_PATH, post(post_message))
        .with_state(gateway)
}

async fn open_stream(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ScopeQuery>,
) -> Response {
    let scope = match query.resolve(&gateway) {
        Ok(scope) => scope,
        Err(rejection) => return rejection,
    };

    let session_id = gateway.new_session_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    // Queued before registration so it is always the first event.
    let _ = tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("{MESSAGES_PATH}?sessionId={session_id}")),
    );

    let endpoint = FrontendEndpoint::new(
        session_id.clone(),
        Arc::clone(gateway.aggregator()),
        scope,
    );
    let transport = PushTransport {
        tx,
        closed: closed.clone(),
    };
    gateway.sse_sessions().insert(
        Arc::new(FrontendSession::new(endpoint, transport)),
        gateway.connections().subscribe(),
    );

    let guard = SessionGuard {
        registry: Arc::clone(gateway.sse_sessions()),
        id: session_id,
    };
    let events = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), (rx, guard)))
    })
    .take_until(closed.cancelled_owned());

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response()
}

async fn post_message(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            "Bad Request: Missing sessionId parameter",
        );
    };
    let Some(session) = gateway.sse_sessions().get(&session_id) else {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            format!("Bad Request: No session found for sessionId {session_id}"),
        );
    };
    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(rejection) => return rejection,
    };

    tokio::spawn(async move {
        if let Some(reply) = session.handle(message).await {
            session.transport().deliver(reply).await;
        }
    });
    (StatusCode::ACCEPTED, "Accepted").into_response()
}
