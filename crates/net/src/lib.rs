//! HTTP networking layer for ringkv.
//!
//! Provides:
//! - the entity API (`/v0/entity`) for clients and, with `X-Internal: true`,
//!   for peer coordinators
//! - `HttpReplicaClient`: implements `ReplicaClient` over reqwest
//! - status (`/v0/status`) and Prometheus (`/metrics`) endpoints
//! - `build_server`: assembles all routes into an axum `Router`

pub mod convert;
pub mod replica_client;
pub mod server;

pub use replica_client::HttpReplicaClient;
pub use server::{AppState, StatusResponse};

use ringkv_kv::{Coordinator, ReplicaClient};
use std::sync::Arc;
use std::time::Instant;

/// Build an axum `Router` serving every endpoint of a node.
pub fn build_server<R: ReplicaClient>(coordinator: Arc<Coordinator<R>>) -> axum::Router {
    let state = Arc::new(AppState {
        coordinator,
        start_time: Instant::now(),
    });
    server::routes(state)
}
