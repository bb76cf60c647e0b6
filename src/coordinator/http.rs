//! HTTP API for the coordinator
//!
//! Files:
//! - `PUT /files/:name` streams the request body in as a new file version
//! - `GET /files/:name` streams the file back
//! - `DELETE /files/:name`, `GET /files/:name/meta`, `GET /files`
//!
//! Cluster:
//! - `POST /nodes/heartbeat`, `POST /nodes/:id/decommission`
//! - `GET /cluster/status`, `GET /health`, `GET /metrics`
//!
//! Filenames are percent-encoded in the path, so names containing `/`
//! travel as a single segment.

use crate::common::{Error, FileSummary, HeartbeatRequest, Result, CHECKSUM_HEADER};
use crate::coordinator::download::DownloadOptions;
use crate::coordinator::service::Coordinator;
use crate::coordinator::upload::UploadOptions;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct CoordState {
    pub coordinator: Coordinator,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// Replicate one chunk at a time
    #[serde(default)]
    pub sequential: bool,
    /// Chunks in flight at once; ignored when `sequential` is set
    pub pipeline_depth: Option<usize>,
    /// Abort the transfer after this many milliseconds
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub deadline_ms: Option<u64>,
}

impl UploadQuery {
    fn options(&self) -> UploadOptions {
        let mut options = if self.sequential {
            UploadOptions::sequential()
        } else {
            UploadOptions {
                pipeline_depth: self.pipeline_depth.filter(|d| *d > 0),
                ..Default::default()
            }
        };
        options.deadline = self.deadline_ms.map(Duration::from_millis);
        options
    }
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        // Files
        .route("/files", axum::routing::get(list_files))
        .route("/files/:name", axum::routing::put(upload_file))
        .route("/files/:name", axum::routing::get(download_file))
        .route("/files/:name", axum::routing::delete(delete_file))
        .route("/files/:name/meta", axum::routing::get(file_meta))
        // Storage nodes
        .route("/nodes/heartbeat", axum::routing::post(heartbeat))
        .route("/nodes/:id/decommission", axum::routing::post(decommission))
        // Observability
        .route("/cluster/status", axum::routing::get(cluster_status))
        .route("/health", axum::routing::get(health))
        .route("/metrics", axum::routing::get(metrics))
        // Uploads are streamed; size is bounded by the nodes, not here
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload_file(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<impl IntoResponse> {
    let record = state
        .coordinator
        .upload(&name, body.into_data_stream(), query.options())
        .await?;
    Ok(Json(FileSummary::from(record.as_ref())))
}

/// Stream a file back.
///
/// The first chunk is fetched before the status line goes out, so a file
/// whose first chunk cannot be read gets a proper error response. A failure
/// on any later chunk can only abort the connection once the `200` is out,
/// so the client sees fewer bytes than `Content-Length` and a transport error.
async fn download_file(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let options = DownloadOptions {
        deadline: query.deadline_ms.map(Duration::from_millis),
    };
    let download = state.coordinator.download_with(&name, options).await?;
    let record = download.record().clone();

    let mut rest = download.into_stream();
    let first = rest.next().await.transpose()?;
    let body = stream::iter(first.map(Ok::<_, Error>)).chain(rest);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, record.total_size)
        .header(CHECKSUM_HEADER, record.checksum.as_str())
        .body(Body::from_stream(body))
        .map_err(|e| Error::Internal(format!("response build failed: {}", e)))?;
    Ok(response)
}

async fn delete_file(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.coordinator.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn file_meta(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state.coordinator.file(&name)?;
    Ok(Json(record.as_ref().clone()))
}

async fn list_files(State(state): State<CoordState>) -> impl IntoResponse {
    let files: Vec<FileSummary> = state
        .coordinator
        .files()
        .iter()
        .map(|record| FileSummary::from(record.as_ref()))
        .collect();
    Json(files)
}

async fn heartbeat(
    State(state): State<CoordState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse> {
    let ack = state.coordinator.heartbeat(req).await?;
    Ok(Json(ack))
}

async fn decommission(
    State(state): State<CoordState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.coordinator.decommission(&node_id).await? {
        return Err(Error::NotFound(format!("node {}", node_id)));
    }
    Ok(Json(json!({
        "node_id": node_id,
        "decommissioned": true,
    })))
}

async fn cluster_status(State(state): State<CoordState>) -> impl IntoResponse {
    Json(state.coordinator.cluster_status())
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    let live = state.coordinator.placement().live_nodes().len();
    let replicas = state.coordinator.config().replicas;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_nodes": live,
        "writable": live >= replicas,
    }))
}

async fn metrics(State(state): State<CoordState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.coordinator.metrics().to_prometheus(),
    )
}
