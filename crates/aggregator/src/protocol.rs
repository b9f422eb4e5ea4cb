//! What the aggregator layers on top of `rmcp::model`: negotiated revisions, the two
//! gateway-specific error codes, and the naming hook shared by listed capabilities.

pub use rmcp::model::JsonObject;
use rmcp::model::{CallToolResult, ErrorCode, LoggingLevel, Prompt, ProtocolVersion, Resource, Tool};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;

/// Protocol revision the aggregator requests from backends and offers by default.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V_2025_03_26;

/// Revisions a frontend client may negotiate.
pub const SUPPORTED_PROTOCOL_VERSIONS: [ProtocolVersion; 3] = [
    ProtocolVersion::V_2025_06_18,
    ProtocolVersion::V_2025_03_26,
    ProtocolVersion::V_2024_11_05,
];

/// Generic transport-level rejection (missing session, bad headers).
pub const BAD_REQUEST: ErrorCode = ErrorCode(-32000);
pub const SERVER_UNAVAILABLE: ErrorCode = ErrorCode(-32001);

/// Error envelope with a null id, used where no request id could be recovered.
pub fn error_envelope(code: ErrorCode, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": code, "message": message.into() }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "Tool",
            Self::Prompt => "Prompt",
            Self::Resource => "Resource",
        })
    }
}

/// A listed capability, keyed by the name (or URI) clients address it by.
pub trait Capability: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
}

impl Capability for Tool {
    fn key(&self) -> &str {
        &self.name
    }

    fn set_key(&mut self, key: String) {
        self.name = key.into();
    }
}

impl Capability for Prompt {
    fn key(&self) -> &str {
        &self.name
    }

    fn set_key(&mut self, key: String) {
        self.name = key;
    }
}

impl Capability for Resource {
    fn key(&self) -> &str {
        &self.raw.uri
    }

    fn set_key(&mut self, key: String) {
        self.raw.uri = key;
    }
}

/// Rank of a log level, least to most severe. `LoggingLevel` has no ordering of its own.
pub fn severity(level: LoggingLevel) -> u8 {
    match level {
        LoggingLevel::Debug => 0,
        LoggingLevel::Info => 1,
        LoggingLevel::Notice => 2,
        LoggingLevel::Warning => 3,
        LoggingLevel::Error => 4,
        LoggingLevel::Critical => 5,
        LoggingLevel::Alert => 6,
        LoggingLevel::Emergency => 7,
    }
}

/// Concatenated text of all text items, mostly for logs and tests.
pub fn joined_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}
