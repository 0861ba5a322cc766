#![forbid(unsafe_code)]

//! Axum backend for videohub.
//!
//! Routes stay thin: they parse the request, call into the library and shape
//! the JSON the frontend expects. Uploads arrive as multipart forms and are
//! spooled to a temporary file before the ingest pipeline copies them into
//! place; streams honour `Range` so browsers can seek.

use std::{
    io::SeekFrom,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{Field, MultipartError},
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use videohub::{
    assets::{AssetRetrieval, StoredAsset},
    categories::CategoryRegistry,
    config::{AllowedOrigins, DEFAULT_CONFIG_PATH, RuntimeOverrides, load_runtime_config},
    error::VideoError,
    ingest::{IngestPipeline, MAX_UPLOAD_BYTES, UploadRequest, UploadedFile},
    metadata::{Category, MetadataStore, VideoRecord},
    security::ensure_not_root,
    storage::StorageLayout,
    thumbnail::FfmpegThumbnailer,
};

/// Room for multipart boundaries and the text fields on top of the file cap.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;
const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_BYTES as usize + MULTIPART_OVERHEAD;
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the videohub upload and streaming API.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Env file with MEDIA_ROOT, VIDEOHUB_PORT and friends"
    )]
    config: PathBuf,
    #[arg(long = "media-root", value_name = "PATH", help = "Override the storage root")]
    media_root: Option<PathBuf>,
    #[arg(long = "database", value_name = "PATH", help = "Override the SQLite database path")]
    database: Option<PathBuf>,
    #[arg(long = "host", value_name = "IP", help = "Address to listen on")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root.clone(),
            database_path: self.database.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Clone)]
struct AppState {
    categories: CategoryRegistry,
    pipeline: Arc<IngestPipeline<FfmpegThumbnailer>>,
    assets: AssetRetrieval,
}

impl AppState {
    fn new(store: MetadataStore, layout: StorageLayout, thumbnailer: FfmpegThumbnailer) -> Self {
        let categories = CategoryRegistry::new(store.clone());
        Self {
            pipeline: Arc::new(IngestPipeline::new(
                store.clone(),
                categories.clone(),
                layout.clone(),
                thumbnailer,
            )),
            assets: AssetRetrieval::new(store, layout),
            categories,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// 404 without a body; absence is the whole answer.
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: String::new(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Upload failures are all reported as 400, storage trouble included.
    /// Anything the client could not have fixed is logged with its cause.
    fn from_upload(err: VideoError) -> Self {
        if !err.is_user_correctable() {
            error!(error = ?err, "upload failed");
        }
        match err {
            VideoError::NotFound => Self::not_found(),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<VideoError> for ApiError {
    fn from(err: VideoError) -> Self {
        match err {
            VideoError::NotFound => Self::not_found(),
            VideoError::Storage(ref cause) => {
                error!(error = ?cause, "storage failure");
                Self::internal(err.to_string())
            }
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.message.is_empty() {
            return self.status.into_response();
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct CreateCategory {
    #[serde(default, alias = "Name")]
    name: Option<String>,
}

/// Video as returned to clients: category names plus absolute URLs for the
/// stream and thumbnail endpoints. Storage paths never leave the server.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDto {
    id: i64,
    title: String,
    description: String,
    categories: Vec<String>,
    thumbnail_url: String,
    video_url: String,
    uploaded_at: String,
}

impl VideoDto {
    fn from_record(record: VideoRecord, base_url: &str) -> Self {
        Self {
            id: record.id,
            thumbnail_url: format!("{base_url}/api/videos/{}/thumbnail", record.id),
            video_url: format!("{base_url}/api/videos/{}/stream", record.id),
            title: record.title,
            description: record.description,
            categories: record
                .categories
                .into_iter()
                .map(|category| category.name)
                .collect(),
            uploaded_at: record.uploaded_at,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    ensure_not_root("videohub backend")?;

    let config = load_runtime_config(&cli.config, cli.overrides())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let layout = StorageLayout::new(&config.media_root);
    layout
        .ensure_dirs()
        .await
        .with_context(|| format!("creating storage under {}", config.media_root.display()))?;
    let store = MetadataStore::open(&config.database_path).context("opening metadata store")?;
    let thumbnailer = FfmpegThumbnailer::new(&config.ffmpeg_path, config.thumbnail_timeout);

    let app = router(AppState::new(store, layout, thumbnailer))
        .layer(cors_layer(&config.allowed_origins)?)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        media_root = %config.media_root.display(),
        database = %config.database_path.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/categories", get(list_categories).post(create_category))
        .route("/api/videos", get(list_videos))
        .route(
            "/api/videos/upload",
            post(upload_video).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/videos/{id}/stream", get(stream_video))
        .route("/api/videos/{id}/thumbnail", get(video_thumbnail))
        .fallback(endpoint_not_found)
        .with_state(state)
}

fn cors_layer(origins: &AllowedOrigins) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    Ok(match origins {
        AllowedOrigins::Any => layer.allow_origin(Any),
        AllowedOrigins::List(list) => {
            let values = list
                .iter()
                .map(|origin| {
                    HeaderValue::from_str(origin)
                        .with_context(|| format!("invalid CORS origin {origin:?}"))
                })
                .collect::<Result<Vec<_>>>()?;
            layer.allow_origin(AllowOrigin::list(values))
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn endpoint_not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "endpoint not found".into(),
    }
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(state.categories.get_all().await?))
}

async fn create_category(
    State(state): State<AppState>,
    body: Result<Json<CreateCategory>, JsonRejection>,
) -> ApiResult<Json<Category>> {
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let name = body.name.unwrap_or_default();
    if name.trim().is_empty() {
        return Err(ApiError::bad_request("Name is required"));
    }
    Ok(Json(state.categories.get_or_create(&name).await?))
}

async fn list_videos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<VideoDto>>> {
    let base_url = request_base_url(&headers);
    let videos = state.assets.list_videos().await?;
    Ok(Json(
        videos
            .into_iter()
            .map(|record| VideoDto::from_record(record, &base_url))
            .collect(),
    ))
}

async fn upload_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<VideoDto>)> {
    let staging = state.pipeline.layout().videos_dir().to_path_buf();
    state
        .pipeline
        .layout()
        .ensure_dirs()
        .await
        .map_err(|err| ApiError::from_upload(VideoError::Storage(err.into())))?;

    let (request, spool) = read_upload_form(&mut multipart, &staging).await?;

    // Detached so a client hanging up mid-ingest cannot cancel it halfway.
    let pipeline = Arc::clone(&state.pipeline);
    let record = tokio::spawn(async move {
        // The spooled upload must outlive the copy.
        let _spool = spool;
        pipeline.upload(request).await
    })
    .await
    .map_err(|err| ApiError::from_upload(VideoError::Storage(err.into())))?
    .map_err(ApiError::from_upload)?;

    let base_url = request_base_url(&headers);
    Ok((
        StatusCode::CREATED,
        Json(VideoDto::from_record(record, &base_url)),
    ))
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let asset = state.assets.open_video(id).await?;
    let content_type = video_content_type(&asset.file_name);
    stream_asset(asset, content_type, &headers).await
}

async fn video_thumbnail(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let asset = state.assets.open_thumbnail(id).await?;
    stream_asset(asset, THUMBNAIL_CONTENT_TYPE.to_string(), &headers).await
}

/// Reads the `Title`, `Description`, `Categories` and `File` fields. Field
/// names are matched case-insensitively; unknown fields are skipped.
async fn read_upload_form(
    multipart: &mut Multipart,
    staging: &Path,
) -> ApiResult<(UploadRequest, Option<TempPath>)> {
    let mut request = UploadRequest::default();
    let mut spool = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_ascii_lowercase();
        match name.as_str() {
            "title" => request.title = field.text().await.map_err(multipart_error)?,
            "description" => {
                request.description = Some(field.text().await.map_err(multipart_error)?)
            }
            "categories" | "categories[]" => request
                .categories
                .push(field.text().await.map_err(multipart_error)?),
            "file" => {
                if request.file.is_some() {
                    return Err(ApiError::bad_request(
                        "Only one file may be uploaded per request",
                    ));
                }
                let (file, path) = spool_field(field, staging).await?;
                request.file = Some(file);
                spool = Some(path);
            }
            _ => {}
        }
    }

    Ok((request, spool))
}

/// Streams one multipart field into a temporary file next to the final
/// storage location and reopens it for reading from the start.
async fn spool_field(mut field: Field<'_>, staging: &Path) -> ApiResult<(UploadedFile, TempPath)> {
    let file_name = field.file_name().unwrap_or_default().to_string();
    let spool_error =
        |err: std::io::Error| ApiError::from_upload(VideoError::Storage(err.into()));

    let (std_file, temp_path) = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(staging)
        .map_err(spool_error)?
        .into_parts();
    let mut file = File::from_std(std_file);

    let mut length = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        length += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(spool_error)?;
    }
    file.flush().await.map_err(spool_error)?;
    file.seek(SeekFrom::Start(0)).await.map_err(spool_error)?;

    Ok((UploadedFile::new(file_name, length, file), temp_path))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::bad_request(VideoError::PayloadTooLarge { length: 0 }.to_string());
    }
    ApiError::bad_request(err.body_text())
}

/// `scheme://host` of the incoming request, honouring a reverse proxy's
/// `X-Forwarded-Proto`.
fn request_base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

fn video_content_type(file_name: &str) -> String {
    MimeGuess::from_path(file_name)
        .first()
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
}

async fn stream_asset(
    asset: StoredAsset,
    content_type: String,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let StoredAsset {
        mut file,
        len: size,
        ..
    } = asset;

    let range = headers
        .get(header::RANGE)
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
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found())?;
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
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header_value(content_type)?);

    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Parses a single `bytes=` range. Multi-range requests and other units are
/// ignored, which makes the caller fall back to a full response.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
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
        // Open-ended past the last byte stays unsatisfiable.
        size.saturating_sub(1).max(start)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
