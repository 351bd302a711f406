//! HTTP handlers.
//!
//! One listener serves three kinds of traffic:
//! - client entity requests, coordinated across replicas,
//! - replica-internal entity requests (`X-Internal: true`), applied to the
//!   local store only,
//! - status and metrics.

use crate::convert::{
    self, is_internal, timestamp_from_headers, timestamp_header_value, NOT_ENOUGH_REPLICAS,
    TIMESTAMP_HEADER,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ringkv_common::Timestamp;
use ringkv_kv::{Coordinator, KvError, ReplicaClient, ReplicationParams};
use ringkv_metrics::{metrics, start_replica_timer};
use ringkv_storage::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

pub struct AppState<R: ReplicaClient> {
    pub coordinator: Arc<Coordinator<R>>,
    pub start_time: Instant,
}

impl<R: ReplicaClient> std::fmt::Debug for AppState<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EntityQuery {
    id: Option<String>,
    replicas: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub healthy: bool,
    pub node_id: String,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

fn with_timestamp(mut response: Response, timestamp: Timestamp) -> Response {
    response
        .headers_mut()
        .insert(TIMESTAMP_HEADER, timestamp_header_value(timestamp));
    response
}

fn kv_error_response(error: KvError) -> Response {
    match error {
        KvError::NotFound => response_error(StatusCode::NOT_FOUND, "Not Found"),
        KvError::QuorumNotReached { .. } => {
            response_error(StatusCode::GATEWAY_TIMEOUT, NOT_ENOUGH_REPLICAS)
        }
        KvError::InvalidParams(e) => response_error(StatusCode::BAD_REQUEST, e.to_string()),
        KvError::Storage(e) => {
            tracing::error!("storage failure: {}", e);
            response_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Extract the key and optional per-request replication from the query.
fn parse_query(query: EntityQuery) -> Result<(String, Option<ReplicationParams>), Response> {
    let id = match query.id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(response_error(StatusCode::BAD_REQUEST, "id is required")),
    };
    let params = match query.replicas {
        Some(replicas) => Some(
            replicas
                .parse::<ReplicationParams>()
                .map_err(|e| response_error(StatusCode::BAD_REQUEST, e.to_string()))?,
        ),
        None => None,
    };
    Ok((id, params))
}

fn required_timestamp(headers: &HeaderMap) -> Result<Timestamp, Response> {
    match timestamp_from_headers(headers) {
        Ok(Some(timestamp)) => Ok(timestamp),
        Ok(None) => Err(response_error(
            StatusCode::BAD_REQUEST,
            "internal write requires a timestamp",
        )),
        Err(e) => Err(response_error(StatusCode::BAD_REQUEST, e)),
    }
}

// ---------------------------------------------------------------------------
// Entity handlers
// ---------------------------------------------------------------------------

pub(crate) async fn entity_get<R: ReplicaClient>(
    State(state): State<Arc<AppState<R>>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
) -> Response {
    let (id, params) = match parse_query(query) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    if is_internal(&headers) {
        metrics()
            .replica_requests_received
            .with_label_values(&["get"])
            .inc();
        let _timer = start_replica_timer("get", "inbound");
        return match state.coordinator.local_get(id.as_bytes()).await {
            Ok(Some(Record {
                value: Some(value),
                timestamp,
                ..
            })) => with_timestamp((StatusCode::OK, value).into_response(), timestamp),
            Ok(Some(Record { timestamp, .. })) => {
                with_timestamp(StatusCode::NOT_FOUND.into_response(), timestamp)
            }
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => kv_error_response(e),
        };
    }

    match state.coordinator.get(id.as_bytes(), params).await {
        Ok(result) => with_timestamp((StatusCode::OK, result.value).into_response(), result.timestamp),
        Err(e) => kv_error_response(e),
    }
}

pub(crate) async fn entity_put<R: ReplicaClient>(
    State(state): State<Arc<AppState<R>>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (id, params) = match parse_query(query) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    if is_internal(&headers) {
        let timestamp = match required_timestamp(&headers) {
            Ok(timestamp) => timestamp,
            Err(response) => return response,
        };
        metrics()
            .replica_requests_received
            .with_label_values(&["put"])
            .inc();
        let _timer = start_replica_timer("put", "inbound");
        let record = Record::put(id.into_bytes(), body.to_vec(), timestamp);
        return match state.coordinator.local_apply(record).await {
            Ok(()) => StatusCode::CREATED.into_response(),
            Err(e) => kv_error_response(e),
        };
    }

    match state
        .coordinator
        .put(id.as_bytes(), body.to_vec(), params)
        .await
    {
        Ok(timestamp) => with_timestamp(StatusCode::CREATED.into_response(), timestamp),
        Err(e) => kv_error_response(e),
    }
}

pub(crate) async fn entity_delete<R: ReplicaClient>(
    State(state): State<Arc<AppState<R>>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
) -> Response {
    let (id, params) = match parse_query(query) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    if is_internal(&headers) {
        let timestamp = match required_timestamp(&headers) {
            Ok(timestamp) => timestamp,
            Err(response) => return response,
        };
        metrics()
            .replica_requests_received
            .with_label_values(&["delete"])
            .inc();
        let _timer = start_replica_timer("delete", "inbound");
        let record = Record::tombstone(id.into_bytes(), timestamp);
        return match state.coordinator.local_apply(record).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => kv_error_response(e),
        };
    }

    match state.coordinator.delete(id.as_bytes(), params).await {
        Ok(timestamp) => with_timestamp(StatusCode::ACCEPTED.into_response(), timestamp),
        Err(e) => kv_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Status and metrics
// ---------------------------------------------------------------------------

pub(crate) async fn status<R: ReplicaClient>(
    State(state): State<Arc<AppState<R>>>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        healthy: true,
        node_id: state.coordinator.local_id().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub(crate) async fn metrics_text() -> Response {
    let mut response = ringkv_metrics::encode_metrics().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

pub(crate) fn routes<R: ReplicaClient>(state: Arc<AppState<R>>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route(
            convert::ENTITY_PATH,
            get(entity_get::<R>)
                .put(entity_put::<R>)
                .delete(entity_delete::<R>),
        )
        .route(convert::STATUS_PATH, get(status::<R>))
        .route(convert::METRICS_PATH, get(metrics_text))
        .with_state(state)
}
