//! HTTP request handlers.

use crate::db::{Book, Chapter, Hadith, Priority, QueueEntry};
use crate::download::{DownloadState, DownloadStatus, StorageInfo};
use crate::error::{AppError, Result};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// BOOKS
// ============================================================================

/// List stored books.
pub async fn list_books(State(state): State<AppState>) -> Result<Json<Vec<Book>>> {
    Ok(Json(state.db().get_all_books()?))
}

/// Get one stored book.
pub async fn get_book(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Book>> {
    state
        .db()
        .get_book(&slug)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("book '{}'", slug)))
}

/// Delete a stored book with its chapters and hadiths.
pub async fn delete_book(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<StatusCode> {
    if state.downloader.delete_book(&slug)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("book '{}'", slug)))
    }
}

/// Chapters of a book.
pub async fn get_chapters(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Chapter>>> {
    Ok(Json(state.db().get_chapters(&slug)?))
}

/// Hadith query parameters.
#[derive(Debug, Deserialize)]
pub struct HadithQuery {
    chapter: Option<i64>,
}

/// Hadiths of a book, optionally of one chapter.
pub async fn get_hadiths(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<HadithQuery>,
) -> Result<Json<Vec<Hadith>>> {
    Ok(Json(state.db().get_hadiths(&slug, query.chapter)?))
}

// ============================================================================
// DOWNLOADS
// ============================================================================

/// Download request options.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    priority: Priority,
}

/// Start downloading a book in the background.
pub async fn start_download(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<(StatusCode, Json<Option<DownloadStatus>>)> {
    let guard = state.downloader.begin(&slug)?;
    state.spawn_download(guard, query.priority);

    Ok((StatusCode::ACCEPTED, Json(state.downloader.current())))
}

/// Batch request body.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    slugs: Vec<String>,
    #[serde(default)]
    priority: Priority,
}

/// Accepted background job.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    /// Books the job will download.
    slugs: Vec<String>,
}

/// Download several books in the background, one after the other.
pub async fn batch_download(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    ensure_idle(&state)?;
    state.spawn_batch(req.slugs.clone(), req.priority);

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse { slugs: req.slugs }),
    ))
}

/// Retry failed downloads in the background.
pub async fn retry_downloads(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    ensure_idle(&state)?;
    let slugs = state
        .downloader
        .retryable_entries()?
        .into_iter()
        .map(|e| e.book_slug)
        .collect();
    state.spawn_retry();

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { slugs })))
}

/// Check downloaded books for remote changes in the background.
pub async fn update_books(State(state): State<AppState>) -> Result<StatusCode> {
    ensure_idle(&state)?;
    state.spawn_update();
    Ok(StatusCode::ACCEPTED)
}

/// Current download response.
#[derive(Debug, Serialize)]
pub struct CurrentResponse {
    state: DownloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    download: Option<DownloadStatus>,
}

/// Status of the running download.
pub async fn current_download(State(state): State<AppState>) -> Json<CurrentResponse> {
    let download = state.downloader.current();
    Json(CurrentResponse {
        state: download
            .as_ref()
            .map(|d| d.state)
            .unwrap_or(DownloadState::Idle),
        download,
    })
}

/// Cancel response.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    cancelled: bool,
}

/// Cancel the running download.
pub async fn cancel_download(State(state): State<AppState>) -> Result<Json<CancelResponse>> {
    let cancelled = state.downloader.cancel_download()?;
    Ok(Json(CancelResponse { cancelled }))
}

fn ensure_idle(state: &AppState) -> Result<()> {
    match state.downloader.current() {
        Some(active) => Err(AppError::AlreadyInProgress(active.slug)),
        None => Ok(()),
    }
}

// ============================================================================
// QUEUE & STORAGE
// ============================================================================

/// Download queue.
pub async fn download_queue(State(state): State<AppState>) -> Result<Json<Vec<QueueEntry>>> {
    Ok(Json(state.downloader.get_download_queue()?))
}

/// Storage response.
#[derive(Debug, Serialize)]
pub struct StorageResponse {
    #[serde(flatten)]
    info: StorageInfo,
    total_size_human: String,
}

/// Storage usage.
pub async fn storage_info(State(state): State<AppState>) -> Result<Json<StorageResponse>> {
    let info = state.downloader.get_storage_info()?;
    Ok(Json(StorageResponse {
        total_size_human: format_size(info.total_size),
        info,
    }))
}

/// Remove all stored data.
pub async fn clear_storage(State(state): State<AppState>) -> Result<StatusCode> {
    state.downloader.clear_all_data()?;
    Ok(StatusCode::NO_CONTENT)
}

/// Format bytes to human-readable string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
