//! Merged view over every active backend.
//!
//! Entries are exposed under a qualified name `server:local`. Lookups accept either form:
//! a qualified name routes directly to its backend, an unqualified one goes to the first
//! active backend (in registration order) that lists it.

use crate::bypass::SchemaBypass;
use crate::connection::{BackendConnection, ConnectionManager};
use crate::error::{AggregatorError, Result};
use crate::normalize::normalize_result;
use crate::peer::PeerError;
use crate::protocol::{Capability, CapabilityKind, JsonObject};
use rmcp::model::{
    CallToolResult, CompleteRequestParam, CompleteResult, GetPromptResult, Prompt,
    ReadResourceResult, Reference, Resource, Tool,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub const QUALIFIER_SEPARATOR: char = ':';

pub fn qualify(server: &str, local: &str) -> String {
    format!("{server}{QUALIFIER_SEPARATOR}{local}")
}

/// Split on the first separator. Local names may themselves contain separators.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIER_SEPARATOR)
}

/// Which backends a frontend endpoint sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every active backend, names qualified.
    Merged,
    /// One backend, names as that backend reports them.
    Single(String),
}

impl Scope {
    pub fn includes(&self, server: &str) -> bool {
        match self {
            Self::Merged => true,
            Self::Single(name) => name == server,
        }
    }
}

/// A capability entry stamped with the backend it came from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregated<T> {
    #[serde(flatten)]
    pub descriptor: T,
    pub server_name: String,
    pub qualified_name: String,
}

impl<T: Capability> Aggregated<T> {
    fn stamp(server: &str, descriptor: T) -> Self {
        Self {
            qualified_name: qualify(server, descriptor.key()),
            server_name: server.to_string(),
            descriptor,
        }
    }

    /// The descriptor as a client of the given scope should see it.
    pub fn exposed(&self, scope: &Scope) -> T {
        let mut descriptor = self.descriptor.clone();
        if matches!(scope, Scope::Merged) {
            descriptor.set_key(self.qualified_name.clone());
        }
        descriptor
    }
}

pub struct Aggregator {
    connections: Arc<ConnectionManager>,
    bypass: SchemaBypass,
}

impl Aggregator {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self::with_bypass(connections, SchemaBypass::default())
    }

    pub fn with_bypass(connections: Arc<ConnectionManager>, bypass: SchemaBypass) -> Self {
        Self {
            connections,
            bypass,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    // ------------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------------

    pub fn list_tools(&self) -> Vec<Aggregated<Tool>> {
        self.list_tools_in(&Scope::Merged)
    }

    pub fn list_prompts(&self) -> Vec<Aggregated<Prompt>> {
        self.list_prompts_in(&Scope::Merged)
    }

    pub fn list_resources(&self) -> Vec<Aggregated<Resource>> {
        self.list_resources_in(&Scope::Merged)
    }

    pub fn list_tools_in(&self, scope: &Scope) -> Vec<Aggregated<Tool>> {
        self.collect(scope, BackendConnection::tools)
    }

    pub fn list_prompts_in(&self, scope: &Scope) -> Vec<Aggregated<Prompt>> {
        self.collect(scope, BackendConnection::prompts)
    }

    pub fn list_resources_in(&self, scope: &Scope) -> Vec<Aggregated<Resource>> {
        self.collect(scope, BackendConnection::resources)
    }

    fn collect<T, F>(&self, scope: &Scope, entries: F) -> Vec<Aggregated<T>>
    where
        T: Capability,
        F: Fn(&BackendConnection) -> Vec<T>,
    {
        self.connections
            .active_connections()
            .iter()
            .filter(|c| scope.includes(c.server_name()))
            .flat_map(|c| {
                entries(c)
                    .into_iter()
                    .map(move |d| Aggregated::stamp(c.server_name(), d))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Find the backend owning `name` and the name to forward to it.
    pub fn resolve(
        &self,
        scope: &Scope,
        kind: CapabilityKind,
        name: &str,
    ) -> Result<(Arc<BackendConnection>, String)> {
        if let Scope::Single(server) = scope {
            return self
                .active(server)
                .map(|connection| (connection, name.to_string()));
        }

        if let Some((server, local)) = split_qualified(name)
            && self.connections.is_configured(server)
        {
            return self
                .active(server)
                .map(|connection| (connection, local.to_string()));
        }

        self.connections
            .active_connections()
            .into_iter()
            .find(|c| c.provides(kind, name))
            .map(|c| (c, name.to_string()))
            .ok_or_else(|| AggregatorError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    fn active(&self, server: &str) -> Result<Arc<BackendConnection>> {
        self.connections
            .get(server)
            .filter(|c| c.is_active())
            .ok_or_else(|| AggregatorError::ServerUnavailable(server.to_string()))
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    pub async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        self.call_tool_in(&Scope::Merged, name, arguments).await
    }

    /// Route a tool call. The result is always a canonical envelope: conformant results
    /// pass through, non-conformant ones are recovered through the schema bypass.
    pub async fn call_tool_in(
        &self,
        scope: &Scope,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        let (connection, local) = self.resolve(scope, CapabilityKind::Tool, name)?;
        let start = Instant::now();

        match connection.peer().call_tool(&local, arguments.clone()).await {
            Ok(result) => {
                tracing::debug!(
                    backend = %connection.server_name(),
                    tool = %local,
                    elapsed = ?start.elapsed(),
                    "tools/call ok"
                );
                Ok(normalize_result(result))
            }
            Err(PeerError::Validation { details, .. }) => {
                tracing::warn!(
                    backend = %connection.server_name(),
                    tool = %local,
                    error = %details,
                    "tool result failed validation; retrying without schema checks"
                );
                Ok(self
                    .bypass
                    .recover_tool_call(connection.peer(), &local, arguments, &details)
                    .await)
            }
            Err(e) => {
                tracing::warn!(
                    backend = %connection.server_name(),
                    tool = %local,
                    error = %e,
                    elapsed = ?start.elapsed(),
                    "tools/call failed"
                );
                Err(e.into())
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult> {
        self.get_prompt_in(&Scope::Merged, name, arguments).await
    }

    pub async fn get_prompt_in(
        &self,
        scope: &Scope,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult> {
        let (connection, local) = self.resolve(scope, CapabilityKind::Prompt, name)?;
        Ok(connection.peer().get_prompt(&local, arguments).await?)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.read_resource_in(&Scope::Merged, uri).await
    }

    pub async fn read_resource_in(&self, scope: &Scope, uri: &str) -> Result<ReadResourceResult> {
        let (connection, local) = self.resolve(scope, CapabilityKind::Resource, uri)?;
        Ok(connection.peer().read_resource(&local).await?)
    }

    pub async fn subscribe_resource_in(&self, scope: &Scope, uri: &str) -> Result<()> {
        let (connection, local) = self.resolve(scope, CapabilityKind::Resource, uri)?;
        Ok(connection.peer().subscribe_resource(&local).await?)
    }

    pub async fn unsubscribe_resource_in(&self, scope: &Scope, uri: &str) -> Result<()> {
        let (connection, local) = self.resolve(scope, CapabilityKind::Resource, uri)?;
        Ok(connection.peer().unsubscribe_resource(&local).await?)
    }

    /// Forward `completion/complete` to the backend owning the referenced prompt or resource.
    pub async fn complete_in(
        &self,
        scope: &Scope,
        mut params: CompleteRequestParam,
    ) -> Result<CompleteResult> {
        let (kind, name) = match &params.r#ref {
            Reference::Prompt(prompt) => (CapabilityKind::Prompt, prompt.name.as_str()),
            Reference::Resource(resource) => (CapabilityKind::Resource, resource.uri.as_str()),
        };
        let (connection, local) = self.resolve(scope, kind, name)?;
        match &mut params.r#ref {
            Reference::Prompt(prompt) => prompt.name = local,
            Reference::Resource(resource) => resource.uri = local,
        }
        Ok(connection.peer().complete(params).await?)
    }
}
