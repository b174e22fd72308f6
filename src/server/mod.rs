//! HTTP front end for the dispatcher.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{engines::EngineStatus, prelude::*, queues::dispatcher::Dispatcher};

use self::error::{AppError, AppResult};

pub mod error;

/// The largest upload we accept.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// The multipart field holding the image.
const IMAGE_FIELD: &str = "image";

/// State shared by all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    dispatcher: Dispatcher,
}

/// Build our router.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dispatcher })
}

/// Serve HTTP requests on `addr` until we receive Ctrl-C.
///
/// The router owns our clone of `dispatcher`, so once this returns, the caller
/// can drop its own clones and wait for the workers to finish.
pub async fn serve(addr: SocketAddr, dispatcher: Dispatcher) -> Result<()> {
    let app = router(dispatcher);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("Server stopped accepting connections");
    Ok(())
}

/// Wait for Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, starting graceful shutdown"),
        Err(err) => {
            // Without a signal handler, we'll just run until killed.
            error!("Failed to install Ctrl-C handler: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

/// Response for `GET /health`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    engine: EngineStatus,
    workers: usize,
    queue_capacity: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.dispatcher.engine().status(),
        workers: state.dispatcher.worker_count(),
        queue_capacity: state.dispatcher.queue_capacity(),
    })
}

/// Response for a successful `POST /upload`.
#[derive(Debug, Serialize)]
struct UploadResponse {
    text: String,
    filename: String,
    engine: String,
}

/// OCR the image in the `image` field of a multipart upload.
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(format!("Failed to read upload: {}", err)))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            trace!(name = ?field.name(), "Skipping multipart field");
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_owned();
        let data = field.bytes().await.map_err(|err| {
            AppError::BadRequest(format!("Failed to read file data: {}", err))
        })?;
        debug!(%filename, bytes = data.len(), "Received upload");

        let text = state.dispatcher.submit(data.to_vec(), &filename).await?;
        return Ok(Json(UploadResponse {
            text,
            filename,
            engine: state.dispatcher.engine().name().to_owned(),
        }));
    }

    Err(AppError::BadRequest(format!(
        "No image provided. Use the field name {:?}",
        IMAGE_FIELD
    )))
}
