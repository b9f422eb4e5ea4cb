//! Newline-delimited JSON-RPC over a backend's stdio, tolerant of sloppy servers.
//!
//! rmcp's stock stdio codec ends the whole session on the first line it cannot decode.
//! Backends in the wild omit `"jsonrpc"` or send broken error objects, and one such reply
//! must not take every other in-flight request down with it. Lines are decoded here
//! instead: a missing version tag is filled in, and an undecodable reply that still
//! carries an id is turned into an error for that id so its caller is released.

use futures::{SinkExt, StreamExt};
use rmcp::RoleClient;
use rmcp::model::{ClientJsonRpcMessage, ErrorData, RequestId, ServerJsonRpcMessage};
use rmcp::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

type SharedWriter<W> = Arc<AsyncMutex<Option<FramedWrite<W, LinesCodec>>>>;

pub(crate) struct LineTransport<R, W> {
    server: String,
    read: FramedRead<R, LinesCodec>,
    write: SharedWriter<W>,
    closed: CancellationToken,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// `closed` is cancelled once the backend's output ends or the transport is closed.
    pub(crate) fn new(server: &str, reader: R, writer: W, closed: CancellationToken) -> Self {
        Self {
            server: server.to_string(),
            read: FramedRead::new(reader, LinesCodec::new()),
            write: Arc::new(AsyncMutex::new(Some(FramedWrite::new(
                writer,
                LinesCodec::new(),
            )))),
            closed,
        }
    }
}

impl<R, W> Transport<RoleClient> for LineTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: ClientJsonRpcMessage,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send + 'static {
        let write = Arc::clone(&self.write);
        let line = serde_json::to_string(&item);
        async move {
            let line = line.map_err(std::io::Error::other)?;
            let mut guard = write.lock().await;
            let Some(sink) = guard.as_mut() else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "backend transport closed",
                ));
            };
            sink.send(line).await.map_err(codec_error)
        }
    }

    async fn receive(&mut self) -> Option<ServerJsonRpcMessage> {
        loop {
            match self.read.next().await {
                Some(Ok(line)) => {
                    if let Some(message) = decode_line(&self.server, &line) {
                        return Some(message);
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(server = %self.server, "discarding oversized line from backend");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::warn!(server = %self.server, error = %e, "backend read failed");
                    self.closed.cancel();
                    return None;
                }
                None => {
                    tracing::debug!(server = %self.server, "backend closed its output");
                    self.closed.cancel();
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.closed.cancel();
        drop(self.write.lock().await.take());
        Ok(())
    }
}

fn codec_error(e: LinesCodecError) -> std::io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => std::io::Error::other(e),
    }
}

/// Decode one line from a backend. `None` means the line is skipped.
pub(crate) fn decode_line(server: &str, line: &str) -> Option<ServerJsonRpcMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "discarding non-JSON line from backend");
            return None;
        }
    };
    if let Value::Object(obj) = &mut value {
        obj.entry("jsonrpc").or_insert_with(|| Value::from("2.0"));
    }
    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());

    match serde_json::from_value::<ServerJsonRpcMessage>(value) {
        Ok(message) => Some(message),
        Err(e) => {
            let Some(id) = id else {
                tracing::warn!(server = %server, error = %e, "discarding malformed message from backend");
                return None;
            };
            tracing::warn!(server = %server, %id, error = %e, "malformed reply from backend");
            Some(ServerJsonRpcMessage::error(
                ErrorData::internal_error(format!("malformed reply from backend: {e}"), None),
                id,
            ))
        }
    }
}
