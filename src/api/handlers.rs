//! HTTP handlers for the archive API.
//!
//! Identity arrives as the `x-offload-user` header from the fronting
//! reverse proxy; there is no session machinery here.

use super::errors::ApiError;
use crate::archive::{ArchiveService, NewFileInput};
use crate::metrics::Metrics;
use crate::types::{Archive, ArchiveStatus, Part};
use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts as RequestParts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Shared handler state.
pub struct AppState {
    pub service: ArchiveService,
    pub metrics: Arc<Metrics>,
}

/// Authenticated user id, extracted from the `x-offload-user` header.
pub struct UserId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut RequestParts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-offload-user")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or(ApiError::Forbidden)
    }
}

/// Archive view returned by list/get endpoints. Part records are served by
/// their own endpoint; internal workspace paths never leave the server.
#[derive(Debug, Serialize)]
pub struct ArchiveSummary {
    pub id: String,
    pub folder_id: Option<String>,
    pub display_name: String,
    pub download_name: String,
    pub is_bundle: bool,
    pub files: Vec<FileSummary>,
    pub status: ArchiveStatus,
    pub error: Option<String>,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub uploaded_bytes: u64,
    pub uploaded_parts: u32,
    pub total_parts: u32,
    pub priority: u8,
    pub priority_override: bool,
    pub trashed_at: Option<DateTime<Utc>>,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub download_count: u64,
    pub deleted: bool,
}

impl From<&Archive> for ArchiveSummary {
    fn from(a: &Archive) -> Self {
        Self {
            id: a.id.clone(),
            folder_id: a.folder_id.clone(),
            display_name: a.display_name.clone(),
            download_name: a.download_name.clone(),
            is_bundle: a.is_bundle,
            files: a
                .files
                .iter()
                .enumerate()
                .map(|(index, f)| FileSummary {
                    index,
                    name: f.original_name.clone(),
                    size: f.size,
                    download_count: f.download_count,
                    deleted: f.deleted_at.is_some(),
                })
                .collect(),
            status: a.status,
            error: a.error.clone(),
            original_size: a.original_size,
            encrypted_size: a.encrypted_size,
            uploaded_bytes: a.uploaded_bytes,
            uploaded_parts: a.uploaded_parts,
            total_parts: a.total_parts,
            priority: a.priority,
            priority_override: a.priority_override,
            trashed_at: a.trashed_at,
            delete_requested_at: a.delete_requested_at,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

// === Upload ===

/// POST /api/archives — multipart batch upload. Each file part is spooled to
/// disk, then grouped into archives and queued. A part filename carrying
/// directory components ("photos/2026/a.jpg") lands in auto-created
/// sub-folders.
#[instrument(skip(state, multipart))]
pub async fn upload_batch(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let spool_dir = state
        .service
        .config()
        .data_dir
        .join("spool")
        .join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&spool_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut folder_id: Option<String> = None;
    let mut inputs: Vec<NewFileInput> = Vec::new();

    let spooled = async {
        let mut counter = 0usize;
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
        {
            match field.name() {
                Some("folder_id") => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                    if !value.is_empty() {
                        folder_id = Some(value);
                    }
                }
                _ => {
                    let Some(raw_name) = field.file_name().map(|s| s.to_string()) else {
                        continue;
                    };
                    let (relative_dir, original_name) = split_relative_path(&raw_name);

                    let spooled_path = spool_dir.join(format!("u{counter}"));
                    counter += 1;
                    let mut out = tokio::fs::File::create(&spooled_path)
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                    let mut size: u64 = 0;
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))?
                    {
                        size += chunk.len() as u64;
                        tokio::io::AsyncWriteExt::write_all(&mut out, &chunk)
                            .await
                            .map_err(|e| ApiError::Internal(e.to_string()))?;
                    }
                    tokio::io::AsyncWriteExt::flush(&mut out)
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))?;

                    inputs.push(NewFileInput {
                        original_name,
                        spooled_path,
                        size,
                        relative_dir,
                    });
                }
            }
        }
        Ok::<(), ApiError>(())
    }
    .await;

    let result = match spooled {
        Ok(()) => state
            .service
            .create_archives_from_files(&user, folder_id, inputs)
            .await
            .map_err(ApiError::from),
        Err(e) => Err(e),
    };

    // The spool dir only holds leftovers at this point: staged files were
    // moved out, aborted or rejected ones must not linger.
    let _ = tokio::fs::remove_dir_all(&spool_dir).await;

    let ids = result?;
    info!("user {user} queued {} archive(s)", ids.len());
    Ok(Json(json!({ "archives": ids })))
}

/// Split "photos/2026/a.jpg" into (Some("photos/2026"), "a.jpg").
fn split_relative_path(raw: &str) -> (Option<String>, String) {
    let normalized = raw.replace('\\', "/");
    match normalized.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => (Some(dir.to_string()), name.to_string()),
        _ => (None, normalized),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub filename: String,
    #[serde(default)]
    pub folder_id: Option<String>,
}

/// PUT /api/archives/stream — create one archive from a raw request body.
/// Returns the archive id immediately; the upload pipeline finishes in the
/// background and the archive row carries the status.
#[instrument(skip(state, body))]
pub async fn upload_stream(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Query(query): Query<StreamQuery>,
    body: Body,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stream = body.into_data_stream();
    let mut reader = tokio_util::io::StreamReader::new(futures::TryStreamExt::map_err(
        stream,
        |e| std::io::Error::other(e),
    ));

    let id = state
        .service
        .create_archive_streaming(&user, query.folder_id, &query.filename, &mut reader)
        .await?;
    Ok(Json(json!({ "archive": id })))
}

// === Listing & metadata ===

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub trash: Option<u8>,
}

pub async fn list_archives(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ArchiveSummary>>, ApiError> {
    let trash = query.trash.unwrap_or(0) != 0;
    let archives = state.service.list(&user, trash).await?;
    Ok(Json(archives.iter().map(ArchiveSummary::from).collect()))
}

pub async fn get_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<ArchiveSummary>, ApiError> {
    let archive = state.service.get_owned(&user, &id).await?;
    Ok(Json(ArchiveSummary::from(&archive)))
}

pub async fn get_parts(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<Vec<Part>>, ApiError> {
    Ok(Json(state.service.parts_metadata(&user, &id).await?))
}

// === Download ===

fn disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii.replace('"', "_"),
        urlencoding::encode(filename)
    )
}

/// GET /api/archives/:id/download — whole archive, honoring Range for
/// single-file v2 archives.
#[instrument(skip(state, headers))]
pub async fn download(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        let ranged = state.service.stream_range(&user, &id, &range).await?;
        let length = ranged.end - ranged.start + 1;
        let mut response = Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, &ranged.head.content_type)
            .header(header::CONTENT_DISPOSITION, disposition(&ranged.head.filename))
            .header(header::ACCEPT_RANGES, "bytes")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", ranged.start, ranged.end, ranged.total),
            )
            .header(header::CONTENT_LENGTH, length);
        if let Some(etag) = &ranged.head.etag {
            response = response.header(header::ETAG, etag);
        }
        return response
            .body(Body::from_stream(ranged.body))
            .map_err(|e| ApiError::Internal(e.to_string()));
    }

    let whole = state.service.stream_whole(&user, &id).await?;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &whole.head.content_type)
        .header(header::CONTENT_DISPOSITION, disposition(&whole.head.filename));
    if whole.head.accept_ranges {
        response = response.header(header::ACCEPT_RANGES, "bytes");
    }
    if let Some(length) = whole.head.content_length {
        response = response.header(header::CONTENT_LENGTH, length);
    }
    if let Some(etag) = &whole.head.etag {
        response = response.header(header::ETAG, etag);
    }
    response
        .body(Body::from_stream(whole.body))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// GET /api/archives/:id/files/:index — one file out of a bundle.
#[instrument(skip(state))]
pub async fn download_entry(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path((id, index)): Path<(String, usize)>,
) -> Result<Response, ApiError> {
    let entry = state.service.stream_bundle_entry(&user, &id, index).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &entry.head.content_type)
        .header(header::CONTENT_DISPOSITION, disposition(&entry.head.filename))
        .body(Body::from_stream(entry.body))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

pub async fn refresh_part(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path((id, index)): Path<(String, u32)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = state.service.refresh_part_url(&user, &id, index).await?;
    Ok(Json(json!({ "url": url })))
}

/// GET /api/archives/:id/parts/:index/relay — raw ciphertext passthrough.
pub async fn relay_part(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path((id, index)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    let bytes = state.service.relay_part(&user, &id, index).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// === Lifecycle ===

pub async fn trash_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.trash(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restore_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.restore_from_trash(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purge_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.purge(&user, &id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub folder_id: Option<String>,
}

pub async fn move_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<MoveRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .move_to_folder(&user, &id, request.folder_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
    /// When set, renames one bundle entry instead of the archive.
    #[serde(default)]
    pub file_index: Option<usize>,
}

pub async fn rename_archive(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    match request.file_index {
        Some(index) => {
            state
                .service
                .rename_entry(&user, &id, index, &request.name)
                .await?
        }
        None => state.service.rename(&user, &id, &request.name).await?,
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: u8,
    #[serde(default)]
    pub pin: bool,
}

pub async fn set_priority(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<PriorityRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .set_priority(&user, &id, request.priority, request.pin)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Operational endpoints ===

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queued = state.service.store().count_queued().await?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "queued_archives": queued,
    })))
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
