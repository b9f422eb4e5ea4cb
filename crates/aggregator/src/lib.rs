//! Unrelated MCP Aggregator
//!
//! Connects to a set of stdio MCP servers and exposes their tools, prompts and resources
//! as one MCP server over the legacy SSE transport and the streamable HTTP transport.
//! Tool replies that do not match the canonical content envelope are recovered and
//! normalized instead of failing the call.

pub mod aggregator;
pub mod bypass;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod http;
pub mod normalize;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod timeouts;

#[cfg(test)]
mod testing;

pub use aggregator::{Aggregated, Aggregator, Scope};
pub use config::{BackendDescriptor, CliArgs, GatewayConfig, GatewaySettings};
pub use connection::{BackendEvent, ConnectSummary, ConnectionManager, Connector, StdioConnector};
pub use error::{AggregatorError, Result};
pub use gateway::Gateway;
pub use normalize::normalize;
pub use peer::{PeerError, PeerHandle};
