//! In-process fakes for unit tests: a scripted MCP backend on an in-memory duplex pipe,
//! a [`Connector`] that hands those out by server name, and a small SSE frame reader.

use crate::config::{BackendDescriptor, GatewaySettings};
use crate::connection::Connector;
use crate::gateway::Gateway;
use crate::peer::{Notifications, PeerError, PeerHandle};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

pub(crate) enum FakeReply {
    Result(Value),
    Error(i64, String),
    /// Never answer.
    Silent,
    /// A result reply missing its `"jsonrpc"` tag.
    Unversioned(Value),
    /// An error reply whose error object does not decode.
    MalformedError,
}

type CallHandler = Arc<dyn Fn(&str, &Value) -> FakeReply + Send + Sync>;

#[derive(Clone)]
pub(crate) struct FakeBackend {
    tools: Vec<Value>,
    prompts: Vec<Value>,
    resources: Vec<Value>,
    page_size: Option<usize>,
    failing: Vec<String>,
    fail_initialize: bool,
    silent: Vec<String>,
    on_call: CallHandler,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            page_size: None,
            failing: Vec::new(),
            fail_initialize: false,
            silent: Vec::new(),
            on_call: Arc::new(|name, _| {
                FakeReply::Result(json!({
                    "content": [{"type": "text", "text": format!("called {name}")}]
                }))
            }),
        }
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        self.tools.push(tool(name));
        self
    }

    pub fn with_prompt(mut self, name: &str) -> Self {
        self.prompts
            .push(json!({"name": name, "description": format!("prompt {name}")}));
        self
    }

    pub fn with_resource(mut self, uri: &str) -> Self {
        self.resources.push(json!({"uri": uri, "name": uri}));
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Answer `method` with an error instead of a result.
    pub fn failing(mut self, method: &str) -> Self {
        self.failing.push(method.to_string());
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Never answer `method`.
    pub fn silent(mut self, method: &str) -> Self {
        self.silent.push(method.to_string());
        self
    }

    pub fn on_call<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> FakeReply + Send + Sync + 'static,
    {
        self.on_call = Arc::new(handler);
        self
    }

    /// Start the backend and run the client handshake against it.
    pub async fn spawn(
        &self,
        name: &str,
    ) -> Result<(Arc<PeerHandle>, Notifications, FakeControl), PeerError> {
        let (read, write, control) = self.start(name);
        let (peer, notifications) = PeerHandle::connect(name, read, write).await?;
        Ok((peer, notifications, control))
    }

    fn start(
        &self,
        name: &str,
    ) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, FakeControl) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let state = Arc::new(FakeState {
            name: name.to_string(),
            tools: Mutex::new(self.tools.clone()),
            prompts: self.prompts.clone(),
            resources: self.resources.clone(),
            page_size: self.page_size,
            failing: self.failing.clone(),
            fail_initialize: self.fail_initialize,
            silent: self.silent.clone(),
            on_call: Arc::clone(&self.on_call),
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(Arc::clone(&state), server, rx));

        let (read, write) = tokio::io::split(client);
        (read, write, FakeControl { state, control: tx })
    }
}

fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("tool {name}"),
        "inputSchema": {"type": "object"}
    })
}

enum Control {
    Notify(Value),
    HangUp,
}

/// Test-side remote control for a running fake backend.
#[derive(Clone)]
pub(crate) struct FakeControl {
    state: Arc<FakeState>,
    control: mpsc::UnboundedSender<Control>,
}

impl FakeControl {
    pub fn notify(&self, method: &str, params: Option<Value>) {
        let mut message = json!({"jsonrpc": "2.0", "method": method});
        if let Some(params) = params {
            message["params"] = params;
        }
        let _ = self.control.send(Control::Notify(message));
    }

    /// Close the backend's side of the pipe, as if the process exited.
    pub fn hang_up(&self) {
        let _ = self.control.send(Control::HangUp);
    }

    pub fn set_tools(&self, names: &[&str]) {
        *self.state.tools.lock() = names.iter().map(|n| tool(n)).collect();
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

struct FakeState {
    name: String,
    tools: Mutex<Vec<Value>>,
    prompts: Vec<Value>,
    resources: Vec<Value>,
    page_size: Option<usize>,
    failing: Vec<String>,
    fail_initialize: bool,
    silent: Vec<String>,
    on_call: CallHandler,
    calls: AtomicUsize,
}

impl FakeState {
    fn handle(&self, message: &Value) -> Option<Value> {
        let id = message.get("id")?.clone();
        let method = message.get("method")?.as_str()?;
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        if self.silent.iter().any(|m| m == method) {
            return None;
        }
        if self.failing.iter().any(|m| m == method) {
            return Some(error(&id, -32603, &format!("{method} failed")));
        }

        let result = match method {
            "initialize" if self.fail_initialize => {
                return Some(error(&id, -32603, "initialize refused"));
            }
            "initialize" => json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}, "prompts": {}, "resources": {}},
                "serverInfo": {"name": format!("fake-{}", self.name), "version": "0.0.0"}
            }),
            "ping" | "resources/subscribe" | "resources/unsubscribe" => json!({}),
            "tools/list" => self.page("tools", &self.tools.lock(), &params),
            "prompts/list" => self.page("prompts", &self.prompts, &params),
            "resources/list" => self.page("resources", &self.resources, &params),
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let name = params["name"].as_str().unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                match (self.on_call)(name, &arguments) {
                    FakeReply::Result(result) => result,
                    FakeReply::Error(code, message) => return Some(error(&id, code, &message)),
                    FakeReply::Silent => return None,
                    FakeReply::Unversioned(result) => {
                        return Some(json!({"id": id, "result": result}));
                    }
                    FakeReply::MalformedError => {
                        return Some(json!({"jsonrpc": "2.0", "id": id, "error": {"code": "bad"}}));
                    }
                }
            }
            "prompts/get" => json!({
                "description": format!("{} from {}", params["name"].as_str().unwrap_or_default(), self.name),
                "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]
            }),
            "resources/read" => json!({
                "contents": [{"uri": params["uri"], "text": format!("read by {}", self.name)}]
            }),
            "completion/complete" => json!({
                "completion": {
                    "values": [format!("{} via {}", params["argument"]["value"].as_str().unwrap_or_default(), self.name)],
                    "total": 1,
                    "hasMore": false
                }
            }),
            other => return Some(error(&id, -32601, &format!("Method not found: {other}"))),
        };
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    fn page(&self, field: &str, items: &[Value], params: &Value) -> Value {
        let start = params["cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(items.len().max(1));
        let end = (start + size).min(items.len());
        let mut page = json!({ field: items[start..end].to_vec() });
        if end < items.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

async fn serve(
    state: Arc<FakeState>,
    io: tokio::io::DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();
    let mut control_open = true;
    loop {
        tokio::select! {
            cmd = control.recv(), if control_open => match cmd {
                Some(Control::Notify(message)) => write_line(&mut write, &message).await,
                Some(Control::HangUp) => break,
                None => control_open = false,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(message) = serde_json::from_str::<Value>(&line) else { continue };
                if let Some(reply) = state.handle(&message) {
                    write_line(&mut write, &reply).await;
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(write: &mut W, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.flush().await;
}

// ============================================================================
// Connector
// ============================================================================

pub(crate) fn descriptor(name: &str) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        command: format!("fake-{name}"),
        args: Vec::new(),
        env: indexmap::IndexMap::new(),
    }
}

/// Hands out fake backends by server name; unknown names fail to spawn.
#[derive(Default)]
pub(crate) struct FakeConnector {
    backends: HashMap<String, FakeBackend>,
    controls: Mutex<HashMap<String, FakeControl>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, backend: FakeBackend) -> Self {
        self.backends.insert(name.to_string(), backend);
        self
    }

    /// Control handle of the most recent connection to `name`.
    pub fn control(&self, name: &str) -> FakeControl {
        self.controls
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no fake backend connected as {name}"))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<(Arc<PeerHandle>, Notifications), PeerError> {
        let Some(backend) = self.backends.get(&descriptor.name) else {
            return Err(PeerError::Spawn(format!(
                "{}: No such file or directory",
                descriptor.command
            )));
        };
        let (read, write, control) = backend.start(&descriptor.name);
        self.controls
            .lock()
            .insert(descriptor.name.clone(), control);
        PeerHandle::connect(&descriptor.name, read, write).await
    }
}

/// A started gateway over fake backends, keeping the connector around for backend controls.
pub(crate) struct TestGateway {
    gateway: Arc<Gateway>,
    connector: Arc<FakeConnector>,
}

impl TestGateway {
    pub fn control(&self, name: &str) -> FakeControl {
        self.connector.control(name)
    }
}

impl Deref for TestGateway {
    type Target = Arc<Gateway>;

    fn deref(&self) -> &Self::Target {
        &self.gateway
    }
}

pub(crate) async fn test_gateway(names: &[&str], connector: FakeConnector) -> TestGateway {
    let connector = Arc::new(connector);
    let gateway = Arc::new(Gateway::with_connector(
        GatewaySettings::default(),
        names.iter().map(|name| descriptor(name)).collect(),
        Arc::clone(&connector) as Arc<dyn Connector>,
    ));
    gateway.start().await;
    TestGateway { gateway, connector }
}

/// Emit a parameterless notification from the named fake backend.
pub(crate) fn notify_backend(gateway: &TestGateway, server: &str, method: &str) {
    gateway.control(server).notify(method, None);
}

/// Poll `check` until it holds, failing the test after a second.
pub(crate) async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// SSE
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or_else(|e| panic!("bad SSE data {:?}: {e}", self.data))
    }
}

pub(crate) struct SseReader {
    stream: axum::body::BodyDataStream,
    buffer: String,
}

impl SseReader {
    pub fn new(body: axum::body::Body) -> Self {
        Self {
            stream: body.into_data_stream(),
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> SseEvent {
        tokio::time::timeout(Duration::from_secs(2), self.read_event())
            .await
            .expect("timed out waiting for SSE event")
            .expect("SSE stream ended")
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn try_next_event(&mut self) -> Option<SseEvent> {
        tokio::time::timeout(Duration::from_secs(2), self.read_event())
            .await
            .expect("timed out waiting for SSE stream")
    }

    async fn read_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..pos + 2).collect();
                if let Some(event) = parse_frame(&raw) {
                    return Some(event);
                }
                continue;
            }
            let chunk = self.stream.next().await?.expect("body error");
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

fn parse_frame(raw: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data = Vec::new();
    for line in raw.lines() {
        if line.starts_with(':') || line.is_empty() {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "data" => data.push(value.to_string()),
            _ => {}
        }
    }
    if data.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data.join("\n");
    Some(event)
}
