//! Recovery path for tool results that fail validation.
//!
//! The request is re-sent on the same connection as a raw correlated request: the reply
//! is taken as-is and run through [`normalize`]. The re-send has its own request id on the
//! session, so concurrent calls on the connection are unaffected, and a re-send that times
//! out is cancelled on the backend.

use crate::error::AggregatorError;
use crate::normalize::normalize;
use crate::peer::{PeerHandle, tool_call_params};
use crate::protocol::JsonObject;
use crate::timeouts::BYPASS_TIMEOUT;
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SchemaBypass {
    timeout: Duration,
}

impl Default for SchemaBypass {
    fn default() -> Self {
        Self {
            timeout: BYPASS_TIMEOUT,
        }
    }
}

impl SchemaBypass {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-issue a tool call without result validation. Never fails: when recovery does
    /// not succeed, the result is an error envelope describing the validation failure.
    pub async fn recover_tool_call(
        &self,
        peer: &PeerHandle,
        name: &str,
        arguments: Option<JsonObject>,
        validation_error: &str,
    ) -> CallToolResult {
        match self.resend(peer, name, arguments).await {
            Ok(raw) => {
                tracing::info!(server = %peer.name(), tool = %name, "recovered non-conformant tool result");
                normalize(&raw)
            }
            Err(e) => {
                tracing::warn!(server = %peer.name(), tool = %name, error = %e, "schema bypass failed");
                CallToolResult::error(vec![Content::text(format!(
                    "Tool '{name}' returned a result that failed validation: {validation_error}"
                ))])
            }
        }
    }

    async fn resend(
        &self,
        peer: &PeerHandle,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Value, AggregatorError> {
        peer.request_raw(
            "tools/call",
            Some(tool_call_params(name, arguments)),
            self.timeout,
        )
        .await
        .map_err(|e| AggregatorError::Recovery(e.to_string()))
    }
}
