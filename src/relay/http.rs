//! HTTP side channel: flagged audio download and liveness probe.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::alert::AudioClipRef;
use crate::{AppError, Result};

const NO_CACHE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// Handler for `GET /audio/{filename}`.
async fn audio(State(dir): State<Arc<PathBuf>>, Path(filename): Path<String>) -> Response {
    if !AudioClipRef::is_safe_filename(&filename) {
        warn!(filename, "rejected unsafe audio path");
        return (StatusCode::BAD_REQUEST, "invalid file name").into_response();
    }

    match tokio::fs::read(dir.join(&filename)).await {
        Ok(bytes) => {
            debug!(filename, bytes = bytes.len(), "serving audio clip");
            let content_type = content_type_for(&filename);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type)],
                NO_CACHE,
                bytes,
            )
                .into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(err) => {
            warn!(filename, %err, "audio read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response()
        }
    }
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "webm" => "audio/webm",
        Some(ext) if ext == "wav" => "audio/wav",
        Some(ext) if ext == "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Router serving clips from `audio_dir`.
pub fn router(audio_dir: PathBuf) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/audio/{filename}", get(audio))
        .with_state(Arc::new(audio_dir))
}

/// Serve the side channel on `listener` until `ct` fires.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the server fails.
pub async fn serve_http(listener: TcpListener, audio_dir: PathBuf, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_or_else(|_| "unknown".to_owned(), |a| a.to_string());
    info!(%addr, audio_dir = %audio_dir.display(), "http side channel listening");

    axum::serve(listener, router(audio_dir))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http side channel failed: {err}")))?;

    info!("http side channel shut down");
    Ok(())
}

/// Bind the side channel on `addr`.
///
/// # Errors
///
/// Returns [`AppError::Config`] if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind http side channel on {addr}: {err}")))
}
