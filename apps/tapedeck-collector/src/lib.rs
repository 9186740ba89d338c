//! Reference collector: accepts chunks over HTTP, stores them idempotently
//! and serves sessions back for replay.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use futures_util::{Stream, StreamExt, future};
use serde::Serialize;
use serde_json::json;
use tapedeck_protocol::{Chunk, ProjectKey, SessionId, SessionRecord, SessionSummary};
use tapedeck_store::{ChunkStore, FileChunkStore, MemoryChunkStore, StoreError};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Header carrying the project credential.
pub const PROJECT_KEY_HEADER: &str = "x-project-key";

#[derive(Debug, Clone, Parser)]
#[command(name = "tapedeck-collector")]
#[command(about = "Collects and serves tapedeck capture sessions")]
pub struct CollectorConfig {
    #[arg(long, default_value = ".tapedeck")]
    pub root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:3001")]
    pub listen: SocketAddr,
    /// Keep chunks in memory instead of under `--root`.
    #[arg(long)]
    pub in_memory: bool,
}

/// Notice published for every newly stored chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestNotice {
    pub session_id: SessionId,
    #[serde(skip)]
    pub project_key: ProjectKey,
    pub idx: u64,
    pub events: usize,
    pub has_snapshot: bool,
}

#[derive(Clone, Debug)]
pub struct IngestFeed {
    sender: broadcast::Sender<IngestNotice>,
}

impl IngestFeed {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, notice: IngestNotice) {
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestNotice> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<IngestNotice> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn ChunkStore>,
    feed: IngestFeed,
}

impl AppState {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            feed: IngestFeed::new(1024),
        }
    }

    pub fn feed(&self) -> &IngestFeed {
        &self.feed
    }
}

#[derive(Debug, Serialize)]
pub struct IngestAck {
    pub accepted: bool,
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        let status = match &error {
            StoreError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::ProjectMismatch { .. } => StatusCode::FORBIDDEN,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ingest", post(ingest))
        .route("/ingest/stream", get(ingest_stream))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind `config.listen` and serve until Ctrl+C or SIGTERM.
pub async fn serve(config: CollectorConfig) -> Result<()> {
    let store: Arc<dyn ChunkStore> = if config.in_memory {
        Arc::new(MemoryChunkStore::new())
    } else {
        Arc::new(FileChunkStore::new(&config.root))
    };
    let app = router(AppState::new(store));

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen = %config.listen,
        root = %config.root.display(),
        in_memory = config.in_memory,
        "tapedeck-collector listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "tapedeck-collector"
    }))
}

fn project_key(headers: &HeaderMap) -> ApiResult<ProjectKey> {
    headers
        .get(PROJECT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ProjectKey::from_string)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing X-Project-Key header"))
}

#[instrument(skip_all)]
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestAck>> {
    let key = project_key(&headers)?;
    // Decoded straight from the body so the received `events` text is kept
    // for digest verification.
    let chunk: Chunk = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid chunk: {err}")))?;

    if chunk.project_key != key {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "chunk project does not match credential",
        ));
    }
    chunk.validate().map_err(|fault| {
        ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("chunk {} rejected: {fault}", chunk.idx),
        )
    })?;
    if !chunk.digest_matches() {
        // Stored anyway; the integrity report on read flags it.
        warn!(session_id = %chunk.session_id, idx = chunk.idx, "chunk digest does not reproduce");
    }

    let outcome = state.store.put(&chunk, Utc::now()).await?;
    if !outcome.is_duplicate() {
        state.feed.publish(IngestNotice {
            session_id: chunk.session_id.clone(),
            project_key: chunk.project_key.clone(),
            idx: chunk.idx,
            events: chunk.events.len(),
            has_snapshot: chunk.has_snapshot,
        });
    }
    debug!(session_id = %chunk.session_id, idx = chunk.idx, ?outcome, "chunk ingested");

    Ok(Json(IngestAck {
        accepted: true,
        duplicate: outcome.is_duplicate(),
    }))
}

async fn ingest_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let key = project_key(&headers)?;
    let stream = state.feed.subscribe_stream().filter_map(move |notice| {
        let event = match notice {
            Ok(notice) if notice.project_key == key => Event::default()
                .event("chunk")
                .id(format!("{}:{}", notice.session_id, notice.idx))
                .json_data(&notice)
                .ok()
                .map(Ok),
            Ok(_) => None,
            Err(error) => {
                warn!(%error, "ingest stream subscriber lagged");
                None
            }
        };
        future::ready(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let key = project_key(&headers)?;
    let sessions = state
        .store
        .list_sessions()
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .filter(|summary| summary.project_key == key)
        .collect();
    Ok(Json(sessions))
}

async fn get_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SessionRecord>> {
    let key = project_key(&headers)?;
    let session_id = SessionId::from_string(session_id);
    let record = state
        .store
        .session(&session_id)
        .await
        .map_err(ApiError::internal)?
        .filter(|record| record.summary.project_key == key)
        .ok_or_else(|| {
            ApiError::new(StatusCode::NOT_FOUND, format!("session {session_id} not found"))
        })?;
    Ok(Json(record))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
