//! Ingest receiver (`lapse serve`).
//!
//! Accepts `POST /upload` from known devices and stores each frame under
//! `{root}/{device_id}/{filename}`. Writes go through a temporary file and a
//! rename, so a re-sent frame replaces the earlier copy instead of producing
//! a duplicate or a torn file.

mod validation;

pub use validation::{FILENAME_PATTERN, has_jpeg_magic, is_valid_filename, verify_jpeg};

use crate::config::ReceiverConfig;
use crate::transport::{DEVICE_ID_HEADER, FILENAME_HEADER, UPLOAD_PATH};
use crate::{Error, Result};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// JSON body of every receiver response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct UploadResponse {
    /// `success` or `error`.
    pub status: String,
    /// Human-readable detail.
    pub message: String,
}

struct Reply(StatusCode, UploadResponse);

impl Reply {
    fn ok(message: impl Into<String>) -> Self {
        Self(
            StatusCode::OK,
            UploadResponse {
                status: "success".to_string(),
                message: message.into(),
            },
        )
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self(
            status,
            UploadResponse {
                status: "error".to_string(),
                message: message.into(),
            },
        )
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let label = if self.0.is_success() { "stored" } else { "rejected" };
        metrics::counter!("lapse_receiver_uploads_total", "status" => label).increment(1);
        (self.0, Json(self.1)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ReceiverConfig>,
}

/// Builds the receiver's router.
#[must_use]
pub fn router(config: ReceiverConfig) -> Router {
    let body_limit = config
        .devices
        .iter()
        .map(|d| d.max_file_size_bytes)
        .max()
        .unwrap_or(0)
        .saturating_add(1);

    Router::new()
        .route(UPLOAD_PATH, post(upload))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            config: Arc::new(config),
        })
}

async fn health() -> Json<UploadResponse> {
    Json(UploadResponse {
        status: "success".to_string(),
        message: "ok".to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Reply {
    let Some(device_id) = header_str(&headers, DEVICE_ID_HEADER) else {
        return Reply::error(StatusCode::BAD_REQUEST, "missing device id");
    };
    let Some(device) = state.config.device(device_id) else {
        tracing::warn!(device_id, "Upload from unknown device");
        return Reply::error(StatusCode::FORBIDDEN, "unknown device");
    };

    let body = match body {
        Ok(body) => body,
        Err(rejection) => return Reply::error(rejection.status(), rejection.body_text()),
    };
    if body.is_empty() {
        return Reply::error(StatusCode::BAD_REQUEST, "empty body");
    }
    if body.len() > device.max_file_size_bytes {
        return Reply::error(StatusCode::PAYLOAD_TOO_LARGE, "file too large");
    }
    if !has_jpeg_magic(&body) {
        return Reply::error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "not jpeg");
    }

    let Some(filename) = header_str(&headers, FILENAME_HEADER) else {
        return Reply::error(StatusCode::BAD_REQUEST, "missing filename header");
    };
    if !is_valid_filename(filename) {
        return Reply::error(StatusCode::BAD_REQUEST, "invalid filename format");
    }

    let filename = filename.to_string();
    let device_dir = state.config.root.join(&device.device_id);
    let size = body.len();
    let stored = tokio::task::spawn_blocking({
        let filename = filename.clone();
        move || -> Result<PathBuf> {
            verify_jpeg(&body)?;
            store_atomically(&device_dir, &filename, &body)
        }
    })
    .await;

    match stored {
        Ok(Ok(path)) => {
            tracing::info!(
                device_id = %device.device_id,
                filename = %filename,
                bytes = size,
                path = %path.display(),
                "Stored upload"
            );
            Reply::ok(format!("file {filename} uploaded"))
        },
        Ok(Err(Error::InvalidInput(reason))) => Reply::error(StatusCode::BAD_REQUEST, reason),
        Ok(Err(e)) => {
            tracing::error!(filename = %filename, error = %e, "Cannot store upload");
            Reply::error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        },
        Err(e) => {
            tracing::error!(filename = %filename, error = %e, "Upload worker failed");
            Reply::error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        },
    }
}

/// Writes `data` to `dir/filename` via a synced temporary file and a rename.
fn store_atomically(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::operation("create_device_dir", format!("{}: {e}", dir.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::operation("create_temp_file", e))?;
    tmp.write_all(data)
        .map_err(|e| Error::operation("write_upload", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::operation("sync_upload", e))?;

    let target = dir.join(filename);
    tmp.persist(&target)
        .map_err(|e| Error::operation("persist_upload", e.error))?;
    Ok(target)
}

/// Serves on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the server fails.
pub async fn serve_listener<F>(
    listener: tokio::net::TcpListener,
    config: ReceiverConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(
            %addr,
            root = %config.root.display(),
            devices = config.devices.len(),
            "Receiver listening"
        );
    }
    axum::serve(listener, router(config))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::operation("serve", e))
}

/// Runs the receiver until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the runtime cannot start, the
/// address cannot be bound, or the server fails.
pub fn serve(config: ReceiverConfig) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().map_err(|e| Error::operation("create_runtime", e))?;

    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.listen)
            .await
            .map_err(|e| Error::operation("bind", format!("{}: {e}", config.listen)))?;
        serve_listener(listener, config, shutdown_signal()).await
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Receiver shutting down");
}
