//! Streamable HTTP transport on a single `/mcp` path.
//!
//! - `POST` carries client messages. Requests are answered with a one-event SSE body; the
//!   reply is also appended to the event log so a reconnecting client can replay it.
//! - `GET` opens the server-to-client stream, replaying from `Last-Event-ID` when present.
//! - `DELETE` ends the session.

use super::event_log::{EventRecord, EventStore, parse_event_id};
use super::registry::{FrontendSession, SessionTransport};
use super::{
    EVENT_STREAM_MIME_TYPE, FrontendEndpoint, JSON_MIME_TYPE, ScopeQuery, is_initialize_request,
    jsonrpc_error_response, parse_body,
};
use crate::gateway::Gateway;
use crate::protocol::BAD_REQUEST;
use crate::timeouts::SSE_KEEP_ALIVE;
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::StreamExt;
use parking_lot::Mutex;
use rmcp::model::{ClientJsonRpcMessage, ErrorCode};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::Instrument;

pub const MCP_PATH: &str = "/mcp";
pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

/// Outbound side of a streamable session: everything goes through the event log, and
/// server-initiated messages are additionally pushed to the attached GET stream, if any.
pub struct StreamableTransport {
    stream_id: String,
    store: Arc<dyn EventStore>,
    live: Mutex<Option<mpsc::UnboundedSender<EventRecord>>>,
    closed: CancellationToken,
}

impl StreamableTransport {
    pub fn new(stream_id: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        Self {
            stream_id: stream_id.into(),
            store,
            live: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Append a message to this session's stream in the event log.
    pub async fn record(&self, message: Value) -> EventRecord {
        let event_id = self.store.store_event(&self.stream_id, message.clone()).await;
        EventRecord {
            event_id,
            stream_id: self.stream_id.clone(),
            message,
        }
    }

    /// Attach a new GET stream. A previously attached stream ends.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<EventRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock() = Some(tx);
        rx
    }

    pub fn has_listener(&self) -> bool {
        self.live.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn closed(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }
}

#[async_trait]
impl SessionTransport for StreamableTransport {
    async fn deliver(&self, message: Value) {
        let record = self.record(message).await;
        if let Some(tx) = self.live.lock().as_ref() {
            let _ = tx.send(record);
        }
    }

    fn close(&self) {
        self.live.lock().take();
        self.closed.cancel();
        self.store.remove_stream(&self.stream_id);
    }

    fn is_streaming(&self) -> bool {
        self.has_listener()
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(MCP_PATH, post(post_mcp).get(get_mcp).delete(delete_mcp))
        .with_state(gateway)
}

async fn post_mcp(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ScopeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = ensure_accepts_post(&headers) {
        return rejection.into_response();
    }
    if let Err(rejection) = ensure_json_content_type(&headers) {
        return rejection.into_response();
    }
    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(rejection) => return rejection,
    };

    let Some(session_id) = session_id_header(&headers) else {
        if is_initialize_request(&message) {
            let span = tracing::info_span!("aggregator.mcp.initialize");
            return initialize_session(&gateway, &query, message)
                .instrument(span)
                .await;
        }
        return missing_session();
    };
    let Some(session) = gateway.http_sessions().get(session_id) else {
        return unknown_session(session_id);
    };
    if is_initialize_request(&message) {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::INVALID_REQUEST,
            "Invalid Request: Server already initialized",
        );
    }

    let span = tracing::info_span!(
        "aggregator.mcp.post",
        mcp_session_id = %session_id,
        method = %method_of(&message),
    );
    async move {
        let is_request = matches!(message, ClientJsonRpcMessage::Request(_));
        match session.handle(message).await {
            Some(reply) if is_request => {
                let record = session.transport().record(reply).await;
                single_event_response(record_event(&record))
            }
            _ => StatusCode::ACCEPTED.into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn initialize_session(
    gateway: &Arc<Gateway>,
    query: &ScopeQuery,
    message: ClientJsonRpcMessage,
) -> Response {
    let scope = match query.resolve(gateway) {
        Ok(scope) => scope,
        Err(rejection) => return rejection,
    };
    let session_id = gateway.new_session_id();
    let endpoint = FrontendEndpoint::new(
        session_id.clone(),
        Arc::clone(gateway.aggregator()),
        scope,
    );
    let store: Arc<dyn EventStore> = Arc::clone(gateway.event_store()) as Arc<dyn EventStore>;
    let session = Arc::new(FrontendSession::new(
        endpoint,
        StreamableTransport::new(session_id.clone(), store),
    ));

    let Some(reply) = session.handle(message).await else {
        session.close();
        return jsonrpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::INTERNAL_ERROR,
            "initialize produced no reply",
        );
    };
    if reply.get("error").is_some() {
        // Rejected handshakes never get a session.
        session.close();
        return single_event_response(Event::default().data(reply.to_string()));
    }

    gateway
        .http_sessions()
        .insert(Arc::clone(&session), gateway.connections().subscribe());
    let record = session.transport().record(reply).await;
    let mut response = single_event_response(record_event(&record));
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

async fn get_mcp(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = ensure_accepts_get(&headers) {
        return rejection.into_response();
    }
    let Some(session_id) = session_id_header(&headers) else {
        return missing_session();
    };
    let Some(session) = gateway.http_sessions().get(session_id) else {
        return unknown_session(session_id);
    };
    let last_event_id = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    session.touch();
    let transport = session.transport();
    if let Some(last) = last_event_id
        && !parse_event_id(last).is_some_and(|(stream, _)| stream == transport.stream_id())
    {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            format!("Bad Request: Invalid Last-Event-ID {last}"),
        );
    }

    // Attach before replaying so nothing recorded in between is lost.
    let live = transport.attach();
    let replayed = match last_event_id {
        None => Vec::new(),
        Some(last) => match gateway.event_store().replay_events_after(last).await {
            Ok(records) => records,
            Err(e) => {
                return jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    BAD_REQUEST,
                    format!("Bad Request: {e}"),
                );
            }
        },
    };
    tracing::debug!(
        mcp_session_id = %session_id,
        replayed = replayed.len(),
        "server stream attached"
    );

    let watermark = replayed
        .last()
        .and_then(|record| parse_event_id(&record.event_id))
        .map(|(_, seq)| seq);
    let live = futures::stream::unfold(live, |mut rx| async move {
        rx.recv().await.map(|record| (record, rx))
    })
    .filter(move |record| {
        let fresh = watermark.is_none_or(|seen| {
            parse_event_id(&record.event_id).is_some_and(|(_, seq)| seq > seen)
        });
        futures::future::ready(fresh)
    });
    let events = futures::stream::iter(replayed)
        .chain(live)
        .map(|record| Ok::<_, Infallible>(record_event(&record)))
        .take_until(transport.closed());

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    response
}

async fn delete_mcp(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_header(&headers) else {
        return missing_session();
    };
    if gateway.http_sessions().close(session_id) {
        StatusCode::OK.into_response()
    } else {
        unknown_session(session_id)
    }
}

fn method_of(message: &ClientJsonRpcMessage) -> &str {
    match message {
        ClientJsonRpcMessage::Request(r) => r.request.method(),
        ClientJsonRpcMessage::Notification(_) => "notification",
        _ => "-",
    }
}

fn session_id_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn missing_session() -> Response {
    jsonrpc_error_response(
        StatusCode::BAD_REQUEST,
        BAD_REQUEST,
        "Bad Request: No valid session ID provided",
    )
}

fn unknown_session(session_id: &str) -> Response {
    jsonrpc_error_response(
        StatusCode::BAD_REQUEST,
        BAD_REQUEST,
        format!("Bad Request: No session found for session ID {session_id}"),
    )
}

fn record_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.event_id.clone())
        .data(record.message.to_string())
}

fn single_event_response(event: Event) -> Response {
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(event) });
    let mut response = Sse::new(stream).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    response
}

fn ensure_accepts_post(headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if accept.contains(JSON_MIME_TYPE) && accept.contains(EVENT_STREAM_MIME_TYPE) {
        Ok(())
    } else {
        Err((
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept both application/json and text/event-stream",
        ))
    }
}

fn ensure_accepts_get(headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if accept.contains(EVENT_STREAM_MIME_TYPE) {
        Ok(())
    } else {
        Err((
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept text/event-stream",
        ))
    }
}

fn ensure_json_content_type(headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with(JSON_MIME_TYPE) {
        Ok(())
    } else {
        Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        ))
    }
}
