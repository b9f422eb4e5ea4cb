#![allow(dead_code)]

use anyhow::Context as _;
use clap::Parser as _;
use futures::StreamExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use unrelated_mcp_aggregator::{CliArgs, GatewayConfig};

/// A tiny MCP server in POSIX sh: advertises one `echo` tool whose replies are
/// `{"message": "hello"}` instead of a canonical content envelope. With `STDERR_FLOOD`
/// set it first writes that many bytes of log output to stderr.
const SCRIPT_BACKEND: &str = r#"#!/bin/sh
if [ -n "$STDERR_FLOOD" ]; then
  yes 'backend log line' | head -c "$STDERR_FLOOD" >&2
fi
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"script","version":"0.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"message":"hello"}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done
"#;

pub fn write_script_backend(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("backend.sh");
    std::fs::write(&path, SCRIPT_BACKEND).context("write backend script")?;
    Ok(path)
}

/// Config with a working script backend `good` and a backend `broken` whose command
/// does not exist.
pub fn write_config(dir: &Path, script: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("aggregator.yaml");
    let config = format!(
        r#"
gateway:
  startupTimeout: 10
mcpServers:
  broken:
    command: /nonexistent/definitely-not-a-server
  good:
    command: sh
    args:
      - "{}"
"#,
        script.display()
    );
    std::fs::write(&path, config).context("write config")?;
    Ok(path)
}

/// Config with one script backend that floods stderr before its handshake.
pub fn write_stderr_flood_config(dir: &Path, script: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("flood.yaml");
    let config = format!(
        r#"
gateway:
  startupTimeout: 5
mcpServers:
  noisy:
    command: sh
    args:
      - "{}"
    env:
      STDERR_FLOOD: "262144"
"#,
        script.display()
    );
    std::fs::write(&path, config).context("write config")?;
    Ok(path)
}

/// Config whose only backend command does not exist.
pub fn write_missing_backend_config(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("missing.yaml");
    std::fs::write(
        &path,
        "gateway:\n  startupTimeout: 5\nmcpServers:\n  ghost:\n    command: /nonexistent/ghost-server\n",
    )
    .context("write config")?;
    Ok(path)
}

pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let cli = CliArgs::try_parse_from([
        "unrelated-mcp-aggregator",
        "--config",
        &path.display().to_string(),
    ])?;
    Ok(GatewayConfig::load(cli)?)
}

/// JSON payload of the first `data:` line in an SSE body.
pub fn first_event_json(body: &[u8]) -> anyhow::Result<serde_json::Value> {
    let text = std::str::from_utf8(body).context("SSE body is not UTF-8")?;
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .context("no data line in SSE body")?;
    serde_json::from_str(data.trim_start()).context("parse SSE data")
}

/// Reads `(event, data)` pairs off a live SSE response body.
pub struct EventStream {
    body: axum::body::BodyDataStream,
    buffer: String,
}

impl EventStream {
    pub fn new(body: axum::body::Body) -> Self {
        Self {
            body: body.into_data_stream(),
            buffer: String::new(),
        }
    }

    pub async fn next(&mut self) -> anyhow::Result<(Option<String>, String)> {
        tokio::time::timeout(Duration::from_secs(5), self.read())
            .await
            .context("timed out waiting for SSE event")?
    }

    async fn read(&mut self) -> anyhow::Result<(Option<String>, String)> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..pos + 2).collect();
                let mut event = None;
                let mut data = Vec::new();
                for line in frame.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = Some(v.trim_start().to_string());
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push(v.trim_start().to_string());
                    }
                }
                if !data.is_empty() {
                    return Ok((event, data.join("\n")));
                }
                continue;
            }
            let chunk = self.body.next().await.context("SSE stream ended")??;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}
