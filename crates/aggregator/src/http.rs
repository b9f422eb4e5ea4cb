//! Auxiliary HTTP endpoints: health, status and the aggregated listings.

use crate::aggregator::Aggregated;
use crate::connection::{BackendState, BackendStatus};
use crate::gateway::Gateway;
use axum::{Json, Router, extract::State, routing::get};
use rmcp::model::{Prompt, Resource, Tool};
use serde::Serialize;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/tools", get(tools))
        .route("/prompts", get(prompts))
        .route("/resources", get(resources))
        .with_state(gateway)
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - Always 200 while the process is serving.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

// ============================================================================
// Status
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    active_servers: usize,
    servers: Vec<BackendStatus>,
    sessions: SessionCounts,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionCounts {
    sse: usize,
    streamable_http: usize,
}

/// GET /status - Per-backend state and open session counts.
async fn status(State(gateway): State<Arc<Gateway>>) -> Json<StatusResponse> {
    let servers = gateway.connections().statuses();
    Json(StatusResponse {
        version: VERSION,
        uptime_seconds: gateway.uptime().as_secs(),
        active_servers: servers
            .iter()
            .filter(|s| s.state == BackendState::Active)
            .count(),
        servers,
        sessions: SessionCounts {
            sse: gateway.sse_sessions().len(),
            streamable_http: gateway.http_sessions().len(),
        },
    })
}

// ============================================================================
// Listings
// ============================================================================

#[derive(Serialize)]
struct Listing<T> {
    items: Vec<Aggregated<T>>,
}

async fn tools(State(gateway): State<Arc<Gateway>>) -> Json<Listing<Tool>> {
    Json(Listing {
        items: gateway.aggregator().list_tools(),
    })
}

async fn prompts(State(gateway): State<Arc<Gateway>>) -> Json<Listing<Prompt>> {
    Json(Listing {
        items: gateway.aggregator().list_prompts(),
    })
}

async fn resources(State(gateway): State<Arc<Gateway>>) -> Json<Listing<Resource>> {
    Json(Listing {
        items: gateway.aggregator().list_resources(),
    })
}
