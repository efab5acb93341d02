mod config;
mod convert;
mod error;
mod fetcher;
mod rate_limit;
mod reaper;
mod retry;
mod validate;

use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::convert::{ConversionResult, Orchestrator};
use crate::error::ApiError;
use crate::fetcher::YtDlpFetcher;
use crate::rate_limit::RateLimiter;
use crate::validate::{ConvertRequest, ValidationError, validate};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    limiter: Arc<RateLimiter>,
    download_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tube_convert_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    // Fail fast: without the transcoder nothing downstream can work.
    fetcher::check_ffmpeg()
        .await
        .map_err(|error| ApiError::internal(format!("ffmpeg preflight failed: {error}")))?;

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the download directory: {error}"))
        })?;

    let fetcher = Arc::new(YtDlpFetcher::new(Duration::from_secs(
        config.fetch_timeout_seconds,
    )));
    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(fetcher, &config)),
        limiter: Arc::new(RateLimiter::new(
            config.quota_per_minute,
            config.quota_per_hour,
        )),
        download_dir: config.download_dir.clone(),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/convert", post(convert_handler))
        .route("/download/{filename}", get(download_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!("conversion backend listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn index() -> &'static str {
    "Media conversion API is live."
}

async fn health() -> &'static str {
    "OK"
}

async fn convert_handler(
    State(state): State<AppState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Json<ConversionResult>, ApiError> {
    let Json(raw) =
        payload.map_err(|_| ApiError::bad_request(ValidationError::NotJson.to_string()))?;

    let request = validate(raw).map_err(|error| ApiError::bad_request(error.to_string()))?;

    let identity = request
        .user_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());
    state
        .limiter
        .register(&identity)
        .await
        .map_err(|retry_after| {
            warn!(identity, retry_after, "conversion quota exceeded");
            ApiError::rate_limited(
                "Conversion quota exceeded. Try again later.",
                Some(retry_after),
            )
        })?;

    let request_id = Uuid::new_v4();
    info!(%request_id, url = %request.url, format = ?request.format, "conversion requested");

    let result = state.orchestrator.convert(request).await.map_err(|error| {
        warn!(%request_id, "conversion failed: {error}");
        ApiError::from(error)
    })?;

    Ok(Json(result))
}

async fn download_handler(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    let safe_name =
        safe_basename(&filename).ok_or_else(|| ApiError::not_found("File not found."))?;
    let path = state.download_dir.join(&safe_name);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found."));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not open the requested file: {error}"
            )));
        }
    };

    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&safe_name)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&safe_name))
            .map_err(|_| ApiError::internal("Could not build the disposition header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().extend(headers);
    Ok(response)
}

/// Collapses a requested name to a bare basename so lookups can never leave
/// the download directory. Anything with a path separator or parent
/// component resolves to its final segment only.
fn safe_basename(requested: &str) -> Option<String> {
    let name = Path::new(requested)
        .file_name()
        .and_then(|name| name.to_str())?;

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    Some(name.to_string())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
