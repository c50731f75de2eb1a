//! HTTP server.
//!
//! A thin JSON surface over the import and export engines. Handlers parse
//! and validate the request, hand it to [`Importer`] / [`Exporter`] /
//! [`stream_export`], and marshal the result. No business rules live here.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/imports` | Start an import (multipart upload or JSON `file_url`) |
//! | `GET`  | `/imports/{job_id}` | Import job status, counters and errors |
//! | `GET`  | `/exports` | Stream a whole resource as CSV or NDJSON |
//! | `POST` | `/exports` | Start a filtered export job |
//! | `GET`  | `/exports/{job_id}` | Export job status |
//! | `GET`  | `/exports/{job_id}/download` | Download a completed export |
//!
//! # Idempotency
//!
//! Job creation requires an idempotency key (`Idempotency-Key` header, or
//! `idempotency_key` in an export body). A new job answers `202 Accepted`;
//! a request whose key already names a job answers `200 OK` with that job
//! and has no side effects. For uploads the key is checked before the body
//! is read, so a replayed upload is never written to disk.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown resource 'posts'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `internal` (500). Internal errors are logged; the response only says
//! that something went wrong.

use std::collections::BTreeMap;
use std::str::FromStr;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::context::Context;
use crate::error::BulkError;
use crate::export::{stream_export, CreateExport, Exporter};
use crate::import::{CreateImport, Importer};
use crate::jobs::{JobHandle, JobStatus};
use crate::models::{Format, ResourceKind};
use crate::source::{staged_upload_path, ImportSource};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Bytes buffered between the export task and the response body.
const STREAM_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    ctx: Context,
    importer: Importer,
    exporter: Exporter,
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = Context::connect(config).await?;
    let listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    serve(listener, ctx).await
}

/// Serves on an already-bound listener.
pub async fn serve(listener: TcpListener, ctx: Context) -> anyhow::Result<()> {
    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

pub fn router(ctx: Context) -> Router {
    let state = AppState {
        importer: Importer::new(ctx.clone()),
        exporter: Exporter::new(ctx.clone()),
        ctx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/imports",
            axum::routing::post(handle_create_import).layer(DefaultBodyLimit::disable()),
        )
        .route("/imports/{job_id}", get(handle_get_import))
        .route("/exports", get(handle_stream_export).post(handle_create_export))
        .route("/exports/{job_id}", get(handle_get_export))
        .route("/exports/{job_id}/download", get(handle_download_export))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<BulkError> for AppError {
    fn from(err: BulkError) -> Self {
        match err {
            BulkError::InvalidRequest(message) => bad_request(message),
            BulkError::NotFound(message) => not_found(message),
            BulkError::Internal(err) => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn not_ready(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "not_ready",
        message: message.into(),
    }
}

fn internal(err: impl Into<anyhow::Error>) -> AppError {
    AppError::from(BulkError::Internal(err.into()))
}

/// 202 for a job this request created, 200 for a replay.
fn job_response<J: Serialize>(handle: JobHandle<J>) -> Response {
    let status = if handle.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(handle.job)).into_response()
}

fn parse_resource(raw: &str) -> Result<ResourceKind, AppError> {
    ResourceKind::from_str(raw.trim()).map_err(bad_request)
}

fn parse_format(raw: &str) -> Result<Format, AppError> {
    Format::from_str(raw.trim()).map_err(bad_request)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /imports ============

/// JSON body for a remote-source import.
#[derive(Deserialize)]
struct ImportUrlRequest {
    resource_type: String,
    #[serde(default)]
    format: Option<String>,
    file_url: String,
}

/// Handler for `POST /imports`.
///
/// `multipart/form-data` requests carry a `file` part plus a
/// `resource_type` (and optional `format`) part; the file is streamed to the
/// uploads directory. Any other content type is read as
/// [`ImportUrlRequest`] JSON.
async fn handle_create_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let key = idempotency_key(&headers)
        .ok_or_else(|| bad_request("Idempotency-Key header is required"))?;

    if let Some(job) = state.ctx.jobs.find_import_by_key(&key).await? {
        return Ok((StatusCode::OK, Json(job)).into_response());
    }

    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let create = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        receive_upload(&state, key, multipart).await?
    } else {
        let Json(body) = Json::<ImportUrlRequest>::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        CreateImport {
            idempotency_key: key,
            resource: parse_resource(&body.resource_type)?,
            format: body.format.as_deref().map(parse_format).transpose()?,
            source: ImportSource::Url(body.file_url),
        }
    };

    let handle = state.importer.create_job(create).await?;
    Ok(job_response(handle))
}

async fn receive_upload(
    state: &AppState,
    key: String,
    mut multipart: Multipart,
) -> Result<CreateImport, AppError> {
    let mut resource = None;
    let mut format = None;
    let mut upload: Option<ImportSource> = None;

    let result = async {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "resource_type" => {
                    let text = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                    resource = Some(parse_resource(&text)?);
                }
                "format" => {
                    let text = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                    if !text.trim().is_empty() {
                        format = Some(parse_format(&text)?);
                    }
                }
                "file" if upload.is_none() => {
                    let file_name = field.file_name().unwrap_or("upload").to_string();
                    let uploads_dir = &state.ctx.config.import.uploads_dir;
                    tokio::fs::create_dir_all(uploads_dir).await.map_err(internal)?;
                    let path = staged_upload_path(uploads_dir, &file_name);
                    // Registered before writing so a failed write is cleaned up.
                    upload = Some(ImportSource::Upload {
                        path: path.clone(),
                        file_name,
                    });

                    let mut file = tokio::fs::File::create(&path).await.map_err(internal)?;
                    while let Some(chunk) =
                        field.chunk().await.map_err(|e| bad_request(e.body_text()))?
                    {
                        file.write_all(&chunk).await.map_err(internal)?;
                    }
                    file.flush().await.map_err(internal)?;
                }
                _ => {}
            }
        }
        Ok::<(), AppError>(())
    }
    .await;

    let finish = || -> Result<CreateImport, AppError> {
        result?;
        let source = upload
            .clone()
            .ok_or_else(|| bad_request("multipart field 'file' is required"))?;
        let resource =
            resource.ok_or_else(|| bad_request("multipart field 'resource_type' is required"))?;
        Ok(CreateImport {
            idempotency_key: key,
            resource,
            format,
            source,
        })
    };

    match finish() {
        Ok(create) => Ok(create),
        Err(err) => {
            if let Some(source) = &upload {
                source.discard().await;
            }
            Err(err)
        }
    }
}

// ============ GET /imports/{job_id} ============

async fn handle_get_import(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .ctx
        .jobs
        .get_import(&job_id)
        .await?
        .ok_or_else(|| not_found(format!("import job not found: {}", job_id)))?;
    Ok(Json(job).into_response())
}

// ============ GET /exports ============

#[derive(Deserialize)]
struct StreamExportQuery {
    resource: String,
    #[serde(default)]
    format: Option<String>,
}

/// Handler for `GET /exports`.
///
/// Streams the whole resource as a chunked response. The export runs in its
/// own task writing into an in-memory pipe; when the client disconnects the
/// pipe closes and the task stops at its next write.
async fn handle_stream_export(
    State(state): State<AppState>,
    Query(query): Query<StreamExportQuery>,
) -> Result<Response, AppError> {
    let kind = parse_resource(&query.resource)?;
    let format = match query.format.as_deref() {
        Some(raw) => parse_format(raw)?,
        None => Format::Ndjson,
    };

    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
    let ctx = state.ctx.clone();
    tokio::spawn(async move {
        match stream_export(&ctx, kind, format, &mut writer).await {
            Ok(total) => tracing::info!(resource = %kind, %format, total, "streamed export"),
            Err(err) => tracing::warn!(
                resource = %kind,
                error = %format!("{:#}", anyhow::Error::new(err)),
                "streaming export ended early"
            ),
        }
    });

    let disposition = format!("attachment; filename=\"{}.{}\"", kind, format.extension());
    let mut response = Body::from_stream(ReaderStream::new(reader)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

// ============ POST /exports ============

#[derive(Deserialize)]
struct ExportJobRequest {
    #[serde(default)]
    idempotency_key: Option<String>,
    resource_type: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    fields: Vec<String>,
}

async fn handle_create_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExportJobRequest>,
) -> Result<Response, AppError> {
    let key = body
        .idempotency_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .or_else(|| idempotency_key(&headers))
        .ok_or_else(|| bad_request("idempotency_key is required"))?;

    let filters = body
        .filters
        .into_iter()
        .map(|(name, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(bad_request(format!(
                        "filter '{}' must be a string, boolean or number, got {}",
                        name, other
                    )))
                }
            };
            Ok((name, text))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let create = CreateExport {
        idempotency_key: key,
        resource: parse_resource(&body.resource_type)?,
        format: match body.format.as_deref() {
            Some(raw) => parse_format(raw)?,
            None => Format::Ndjson,
        },
        filters,
        fields: body.fields,
    };

    let handle = state.exporter.create_job(create).await?;
    Ok(job_response(handle))
}

// ============ GET /exports/{job_id} ============

async fn handle_get_export(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .ctx
        .jobs
        .get_export(&job_id)
        .await?
        .ok_or_else(|| not_found(format!("export job not found: {}", job_id)))?;
    Ok(Json(job).into_response())
}

// ============ GET /exports/{job_id}/download ============

async fn handle_download_export(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .ctx
        .jobs
        .get_export(&job_id)
        .await?
        .ok_or_else(|| not_found(format!("export job not found: {}", job_id)))?;

    let path = match (&job.status, &job.file_path) {
        (JobStatus::Completed, Some(path)) => path.clone(),
        (status, _) => {
            return Err(not_ready(format!(
                "export job {} is {}, not completed",
                job_id, status
            )))
        }
    };

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| not_found(format!("export file for job {} is gone", job_id)))?;

    let file_name = std::path::Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.{}", job.resource_type, job.format.extension()));

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(job.format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
