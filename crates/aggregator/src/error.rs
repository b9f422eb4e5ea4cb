//! Error types for the aggregator.

use crate::peer::PeerError;
use crate::protocol::{CapabilityKind, SERVER_UNAVAILABLE};
use rmcp::model::{ErrorCode, ErrorData};
use thiserror::Error;

/// Errors surfaced by the aggregator core.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Backend list is missing, empty, or malformed. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single backend failed to spawn or complete its handshake.
    #[error("Failed to connect to '{server}': {reason}")]
    Connect { server: String, reason: String },

    /// No active backend provides the requested capability.
    #[error("{kind} not found: {name}")]
    NotFound { kind: CapabilityKind, name: String },

    /// The named backend is configured but not currently active.
    #[error("Server '{0}' is not available")]
    ServerUnavailable(String),

    /// The schema-bypass path failed as well (error reply or timeout).
    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl AggregatorError {
    /// JSON-RPC error for this failure, as seen by a frontend client.
    pub fn to_error_data(&self) -> ErrorData {
        let code = match self {
            Self::NotFound { .. } => ErrorCode::INVALID_PARAMS,
            Self::ServerUnavailable(_) => SERVER_UNAVAILABLE,
            Self::Peer(PeerError::Rpc { code, .. }) => ErrorCode(*code),
            _ => ErrorCode::INTERNAL_ERROR,
        };
        let data = match self {
            Self::Peer(PeerError::Rpc { data, .. }) => data.clone(),
            _ => None,
        };
        ErrorData::new(code, self.to_string(), data)
    }
}

/// Result type alias for aggregator operations.
pub type Result<T> = std::result::Result<T, AggregatorError>;
