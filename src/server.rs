//! HTTP surface: catalog endpoints, the download trigger, the audio mount and
//! the frontend bundle with its client-side routing fallback.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::{
    catalog::{CatalogCache, CatalogData, Collection},
    downloads::{DownloadError, Downloader},
    is_safe_segment,
};

const INDEX_FILE: &str = "index.html";

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogCache>,
    pub downloads: Arc<Downloader>,
    pub www_root: Arc<PathBuf>,
    pub downloads_root: Arc<PathBuf>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/songs", get(list_songs))
        .route("/movies", get(list_movies))
        .route("/download", get(download))
        .route("/audio/{user}/{file}", get(serve_audio))
        .fallback(static_fallback)
        .layer(middleware::map_response(allow_any_origin))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn cached_collection(state: &AppState, collection: Collection) -> ApiResult<Arc<CatalogData>> {
    state.catalog.get(collection).ok_or_else(|| {
        let noun = match collection {
            Collection::Songs => "song",
            Collection::Movies => "movie",
        };
        ApiError::not_found(format!("No cached {noun} data available"))
    })
}

async fn list_songs(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let songs = cached_collection(&state, Collection::Songs)?;
    Ok(Json(json!({ "songsList": songs.as_ref() })))
}

async fn list_movies(State(state): State<AppState>) -> ApiResult<Json<CatalogData>> {
    let movies = cached_collection(&state, Collection::Movies)?;
    Ok(Json(movies.as_ref().clone()))
}

/// `url` carries the media id, as the frontend has always sent it.
#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    file: String,
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadResponse>, DownloadError> {
    let outcome = state
        .downloads
        .download(
            query.url.as_deref().unwrap_or_default(),
            query.user_id.as_deref().unwrap_or_default(),
        )
        .await?;
    Ok(Json(DownloadResponse {
        success: true,
        file: outcome.file_url,
    }))
}

async fn serve_audio(
    State(state): State<AppState>,
    AxumPath((user, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_segment(&user) || !is_safe_segment(&file) {
        return Err(ApiError::not_found("file not found"));
    }
    let path = state.downloads_root.join(&user).join(&file);
    stream_file(path, Some(&headers)).await
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    match serve_www_path(&state.www_root, path, req.headers()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Serves a file from the bundle when one matches, otherwise the bundle's
/// entry document so the frontend router can take over.
async fn serve_www_path(
    root: &Path,
    request_path: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let index = root.join(INDEX_FILE);
    let Some(target) = resolve_www_path(root, request_path) else {
        return Err(ApiError::not_found("file not found"));
    };

    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_file() => stream_file(target, Some(headers)).await,
        _ => stream_file(index, None).await,
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(root.join(INDEX_FILE));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(candidate))
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        Body::from_stream(ReaderStream::new(file)).into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
