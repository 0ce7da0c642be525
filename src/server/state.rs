//! Application state shared across handlers.

use crate::db::{Database, Priority};
use crate::download::{DownloadGuard, Downloader, LogObserver};
use crate::fetcher::HttpContentSource;
use std::sync::Arc;

/// Orchestrator backed by the HTTP content API.
pub type HttpDownloader = Downloader<HttpContentSource>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Download orchestrator.
    pub downloader: Arc<HttpDownloader>,
}

impl AppState {
    /// Create application state.
    pub fn new(downloader: HttpDownloader) -> Self {
        Self {
            downloader: Arc::new(downloader),
        }
    }

    /// Store behind the orchestrator.
    pub fn db(&self) -> &Database {
        self.downloader.db()
    }

    /// Run a download in the background. The token is already held by `guard`.
    pub fn spawn_download(&self, guard: DownloadGuard, priority: Priority) {
        let downloader = self.downloader.clone();
        tokio::spawn(async move {
            // Outcome is recorded on the queue entry and logged by the observer.
            let _ = downloader.run(guard, priority, &mut LogObserver).await;
        });
    }

    /// Download several books in the background.
    pub fn spawn_batch(&self, slugs: Vec<String>, priority: Priority) {
        let downloader = self.downloader.clone();
        tokio::spawn(async move {
            downloader
                .batch_download(&slugs, priority, &mut LogObserver)
                .await;
        });
    }

    /// Retry failed downloads in the background.
    pub fn spawn_retry(&self) {
        let downloader = self.downloader.clone();
        tokio::spawn(async move {
            if let Err(e) = downloader.retry_failed_downloads(&mut LogObserver).await {
                tracing::warn!(error = %e, "Retry of failed downloads failed");
            }
        });
    }

    /// Check downloaded books for remote changes in the background.
    pub fn spawn_update(&self) {
        let downloader = self.downloader.clone();
        tokio::spawn(async move {
            match downloader.update_downloaded_books(&mut LogObserver).await {
                Ok(report) => tracing::info!(
                    checked = report.checked,
                    updated = report.updated.len(),
                    failed = report.failed.len(),
                    "Update check finished"
                ),
                Err(e) => tracing::warn!(error = %e, "Update check failed"),
            }
        });
    }
}
