//! HTTP API for a storage node
//!
//! - `PUT /chunks/:key` stores the raw body
//! - `GET /chunks/:key` returns it (404 if absent)
//! - `DELETE /chunks/:key`
//! - `GET /stats`, `GET /health`

use crate::common::{Error, Result};
use crate::node::store::LocalChunkStore;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AgentState {
    pub store: Arc<LocalChunkStore>,
}

pub fn create_router(state: AgentState, max_chunk_bytes: usize) -> Router {
    Router::new()
        .route("/chunks/:key", axum::routing::put(put_chunk))
        .route("/chunks/:key", axum::routing::get(get_chunk))
        .route("/chunks/:key", axum::routing::delete(delete_chunk))
        .route("/stats", axum::routing::get(stats))
        .route("/health", axum::routing::get(health))
        .layer(DefaultBodyLimit::max(max_chunk_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn put_chunk(
    State(state): State<AgentState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    state.store.put(&key, &body).await?;
    Ok(StatusCode::CREATED)
}

async fn get_chunk(
    State(state): State<AgentState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse> {
    let data = state.store.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

async fn delete_chunk(
    State(state): State<AgentState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    if state.store.delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::ChunkMissing {
            node: state.store.node_id().to_string(),
        })
    }
}

async fn stats(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.store.stats())
}

async fn health(State(state): State<AgentState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node_id": state.store.node_id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
