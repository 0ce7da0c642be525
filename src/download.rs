//! Book download orchestration.
//!
//! A download walks metadata, chapters and every chapter's hadiths, then
//! writes the hadiths in one batch. Downloads are serialized through a single
//! token: asking for a second one while the first runs fails with
//! [`AppError::AlreadyInProgress`].
//!
//! Cancellation is best-effort. Rows committed before the cancellation was
//! observed (book, chapters) stay in the store.

mod state;

pub use state::{DownloadGuard, DownloadState, DownloadStatus};

use crate::db::{ChapterRef, CollectionCounts, Database, Priority, QueueEntry, QueueStatus};
use crate::error::{AppError, Result};
use crate::fetcher::ContentSource;
use crate::repair::{self, RepairReport};
use serde::Serialize;
use state::DownloadSlot;

/// Progress checkpoint once book metadata is known.
const PROGRESS_METADATA: f64 = 10.0;
/// Progress checkpoint once the chapter list is known.
const PROGRESS_CHAPTERS: f64 = 30.0;
/// Share of the progress bar spent in the chapter loop.
const PROGRESS_CHAPTER_SPAN: f64 = 60.0;
/// Progress checkpoint once every chapter is fetched.
const PROGRESS_FETCHED: f64 = PROGRESS_CHAPTERS + PROGRESS_CHAPTER_SPAN;

/// Progress reported before fetching chapter `index` of `total`.
pub fn chapter_progress(index: usize, total: usize) -> f64 {
    if total == 0 {
        return PROGRESS_FETCHED;
    }
    PROGRESS_CHAPTERS + (index as f64 / total as f64) * PROGRESS_CHAPTER_SPAN
}

/// Receives download notifications.
pub trait DownloadObserver: Send {
    /// Progress in percent; non-decreasing, ends at 100 on success.
    fn on_progress(&mut self, _slug: &str, _progress: f64) {}

    /// The download finished.
    fn on_complete(&mut self, _summary: &DownloadSummary) {}

    /// The download failed or was cancelled.
    fn on_error(&mut self, _slug: &str, _error: &AppError) {}
}

impl DownloadObserver for () {}

/// Observer that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl DownloadObserver for LogObserver {
    fn on_progress(&mut self, slug: &str, progress: f64) {
        tracing::debug!(slug, progress, "Download progress");
    }

    fn on_complete(&mut self, summary: &DownloadSummary) {
        tracing::info!(
            slug = %summary.slug,
            chapters = summary.total_chapters,
            hadiths = summary.total_hadiths,
            "Download complete"
        );
    }

    fn on_error(&mut self, slug: &str, error: &AppError) {
        tracing::warn!(slug, error = %error, "Download failed");
    }
}

/// Result of a finished download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    /// Downloaded book.
    pub slug: String,
    /// Hadiths written.
    pub total_hadiths: usize,
    /// Chapters written.
    pub total_chapters: usize,
}

/// Per-book result of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Book slug.
    pub slug: String,
    /// Summary when the download succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<DownloadSummary>,
    /// Error message when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    /// Whether the download succeeded.
    pub fn is_success(&self) -> bool {
        self.summary.is_some()
    }
}

/// Result of [`Downloader::update_downloaded_books`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    /// Downloaded books compared against the remote API.
    pub checked: usize,
    /// Books that were downloaded again.
    pub updated: Vec<String>,
    /// Books whose check or download failed.
    pub failed: Vec<BatchOutcome>,
}

/// Storage summary for display.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StorageInfo {
    /// Approximate size in bytes.
    pub total_size: u64,
    /// Row counts per collection.
    pub counts: CollectionCounts,
    /// Books flagged as downloaded.
    pub downloaded_books_count: usize,
}

/// Download orchestrator.
pub struct Downloader<S> {
    db: Database,
    source: S,
    slot: DownloadSlot,
    max_attempts: i64,
}

impl<S: ContentSource> Downloader<S> {
    /// Create an orchestrator over a store and a content source.
    ///
    /// Failed downloads are retried until they have `max_attempts` attempts.
    pub fn new(db: Database, source: S, max_attempts: i64) -> Self {
        Self {
            db,
            source,
            slot: DownloadSlot::default(),
            max_attempts,
        }
    }

    /// Underlying store.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Whether a download holds the token.
    pub fn is_downloading(&self) -> bool {
        self.slot.is_active()
    }

    /// Snapshot of the running download.
    pub fn current(&self) -> Option<DownloadStatus> {
        self.slot.current()
    }

    /// Current step, `Idle` when nothing runs.
    pub fn state(&self) -> DownloadState {
        self.slot
            .current()
            .map(|s| s.state)
            .unwrap_or(DownloadState::Idle)
    }

    /// Take the download token for `slug`.
    ///
    /// Fails with [`AppError::AlreadyInProgress`] without touching the store
    /// when another download runs. Pass the guard to [`Downloader::run`].
    pub fn begin(&self, slug: &str) -> Result<DownloadGuard> {
        self.slot.try_acquire(slug)
    }

    /// Download a whole book.
    pub async fn download_book(
        &self,
        slug: &str,
        priority: Priority,
        observer: &mut dyn DownloadObserver,
    ) -> Result<DownloadSummary> {
        let guard = self.begin(slug)?;
        self.run(guard, priority, observer).await
    }

    /// Run a download whose token was taken with [`Downloader::begin`].
    ///
    /// Every failure is recorded on the queue entry before it is returned.
    pub async fn run(
        &self,
        guard: DownloadGuard,
        priority: Priority,
        observer: &mut dyn DownloadObserver,
    ) -> Result<DownloadSummary> {
        let slug = guard.slug().to_string();
        tracing::info!(slug = %slug, priority = priority.as_str(), "Starting download");
        observer.on_progress(&slug, 0.0);

        let entry = match self.db.add_to_download_queue(&slug, priority) {
            Ok(entry) => entry,
            Err(e) => {
                drop(guard);
                observer.on_error(&slug, &e);
                return Err(e);
            }
        };
        guard.set_queue_id(entry.id);

        match self.execute(&guard, entry.id, observer).await {
            Ok(summary) => {
                drop(guard);
                observer.on_complete(&summary);
                Ok(summary)
            }
            Err(e) if guard.is_cancelled() => {
                // The entry may have been moved to `downloading` after the
                // cancel request marked it.
                if let Err(mark) =
                    self.db
                        .update_queue_item_status(entry.id, QueueStatus::Cancelled, None)
                {
                    tracing::warn!(slug = %slug, error = %mark, "Failed to mark download cancelled");
                }
                drop(guard);
                let e = match e {
                    AppError::Cancelled(_) => e,
                    _ => AppError::Cancelled(slug.clone()),
                };
                tracing::info!(slug = %slug, "Download cancelled");
                observer.on_error(&slug, &e);
                Err(e)
            }
            Err(e) => {
                guard.set_state(DownloadState::Failed);
                match self.db.update_queue_item_status(
                    entry.id,
                    QueueStatus::Failed,
                    Some(&e.to_string()),
                ) {
                    Ok(failed) => tracing::warn!(
                        slug = %slug,
                        attempts = failed.attempts,
                        error = %e,
                        "Download failed"
                    ),
                    Err(mark) => {
                        tracing::error!(slug = %slug, error = %mark, "Failed to mark download failed")
                    }
                }
                drop(guard);
                observer.on_error(&slug, &e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        guard: &DownloadGuard,
        queue_id: i64,
        observer: &mut dyn DownloadObserver,
    ) -> Result<DownloadSummary> {
        let slug = guard.slug();
        self.db
            .update_queue_item_status(queue_id, QueueStatus::Downloading, None)?;

        guard.set_state(DownloadState::FetchingMetadata);
        let mut book = guard.cancellable(self.source.fetch_book(slug)).await?;
        report_progress(guard, observer, PROGRESS_METADATA);

        let remote_chapters = guard.cancellable(self.source.fetch_chapters(slug)).await?;
        report_progress(guard, observer, PROGRESS_CHAPTERS);

        let chapters = self.db.save_chapters(slug, &remote_chapters)?;
        book.chapters = chapters
            .iter()
            .map(|c| ChapterRef {
                id: c.id,
                number: c.number,
            })
            .collect();
        if book.chapters_count == 0 {
            book.chapters_count = chapters.len() as i64;
        }
        self.db.save_book(&book)?;
        tracing::debug!(slug, chapters = chapters.len(), "Saved book and chapters");

        guard.set_state(DownloadState::FetchingHadiths);
        let total = chapters.len();
        let mut hadiths = Vec::new();
        for (index, chapter) in chapters.iter().enumerate() {
            report_progress(guard, observer, chapter_progress(index, total));

            let fetched = guard
                .cancellable(self.source.fetch_hadiths(slug, chapter.number))
                .await?;
            tracing::debug!(slug, chapter = chapter.number, count = fetched.len(), "Fetched chapter");

            // Readers join hadiths to chapters on the store id, not on the
            // remote chapter number.
            hadiths.extend(fetched.into_iter().map(|mut hadith| {
                hadith.book_slug = slug.to_string();
                hadith.chapter_id = chapter.id;
                hadith.chapter_number = Some(chapter.number);
                hadith
            }));
        }
        report_progress(guard, observer, PROGRESS_FETCHED);

        guard.set_state(DownloadState::Persisting);
        if guard.is_cancelled() {
            return Err(AppError::Cancelled(slug.to_string()));
        }
        // Chapters and hadiths the remote no longer serves go with this write
        let chapter_ids: Vec<i64> = chapters.iter().map(|c| c.id).collect();
        let total_hadiths = self
            .db
            .replace_book_content(slug, &chapter_ids, &hadiths)?;
        report_progress(guard, observer, 100.0);

        self.db
            .update_queue_item_status(queue_id, QueueStatus::Completed, None)?;
        self.db.remove_from_queue(queue_id)?;
        guard.set_state(DownloadState::Completed);

        Ok(DownloadSummary {
            slug: slug.to_string(),
            total_hadiths,
            total_chapters: total,
        })
    }

    /// Download several books, one after the other.
    ///
    /// A failure is recorded in the outcome and the batch moves on.
    pub async fn batch_download(
        &self,
        slugs: &[String],
        priority: Priority,
        observer: &mut dyn DownloadObserver,
    ) -> Vec<BatchOutcome> {
        let requests: Vec<(String, Priority)> =
            slugs.iter().map(|slug| (slug.clone(), priority)).collect();
        self.batch(requests, observer).await
    }

    async fn batch(
        &self,
        requests: Vec<(String, Priority)>,
        observer: &mut dyn DownloadObserver,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (slug, priority) in requests {
            let outcome = match self.download_book(&slug, priority, observer).await {
                Ok(summary) => BatchOutcome {
                    slug,
                    summary: Some(summary),
                    error: None,
                },
                Err(e) => BatchOutcome {
                    slug,
                    summary: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        tracing::info!(total = outcomes.len(), failed, "Batch download finished");
        outcomes
    }

    /// Retry failed downloads that are below the attempt ceiling.
    pub async fn retry_failed_downloads(
        &self,
        observer: &mut dyn DownloadObserver,
    ) -> Result<Vec<BatchOutcome>> {
        let requests: Vec<(String, Priority)> = self
            .retryable_entries()?
            .into_iter()
            .map(|entry| (entry.book_slug, entry.priority))
            .collect();

        tracing::info!(count = requests.len(), "Retrying failed downloads");
        Ok(self.batch(requests, observer).await)
    }

    /// Failed queue entries below the attempt ceiling.
    pub fn retryable_entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self
            .db
            .get_download_queue()?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Failed && e.attempts < self.max_attempts)
            .collect())
    }

    /// Cancel the running download.
    ///
    /// Returns whether a download was cancelled. Nothing already written is
    /// rolled back. A download that reached the final write can no longer be
    /// cancelled and completes.
    ///
    /// The token stays held until the cancelled task observes the
    /// cancellation and unwinds, so [`Downloader::is_downloading`] may still
    /// report `true` and [`Downloader::begin`] may still fail with
    /// [`AppError::AlreadyInProgress`] right after this returns.
    pub fn cancel_download(&self) -> Result<bool> {
        let Some(cancelled) = self.slot.cancel() else {
            return Ok(false);
        };

        tracing::info!(slug = %cancelled.slug, "Cancelling download");
        if let Some(id) = cancelled.queue_id {
            match self
                .db
                .update_queue_item_status(id, QueueStatus::Cancelled, None)
            {
                Ok(_) | Err(AppError::QueueItemMissing(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Download again every book whose remote revision changed.
    ///
    /// Any difference in the revision marker triggers a full download.
    pub async fn update_downloaded_books(
        &self,
        observer: &mut dyn DownloadObserver,
    ) -> Result<UpdateReport> {
        let books: Vec<_> = self
            .db
            .get_all_books()?
            .into_iter()
            .filter(|b| b.is_downloaded)
            .collect();

        let mut report = UpdateReport {
            checked: books.len(),
            ..UpdateReport::default()
        };

        for book in books {
            let remote = match self.source.fetch_book(&book.slug).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(slug = %book.slug, error = %e, "Update check failed");
                    report.failed.push(BatchOutcome {
                        slug: book.slug,
                        summary: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            if remote.remote_revision == book.remote_revision {
                tracing::debug!(slug = %book.slug, "Book is up to date");
                continue;
            }

            tracing::info!(
                slug = %book.slug,
                stored = ?book.remote_revision,
                remote = ?remote.remote_revision,
                "Book changed remotely, downloading again"
            );
            match self
                .download_book(&book.slug, Priority::Normal, observer)
                .await
            {
                Ok(_) => report.updated.push(book.slug),
                Err(e) => report.failed.push(BatchOutcome {
                    slug: book.slug,
                    summary: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        Ok(report)
    }

    /// Whether a book is stored and flagged as downloaded.
    pub fn is_book_downloaded(&self, slug: &str) -> Result<bool> {
        Ok(self
            .db
            .get_book(slug)?
            .map(|b| b.is_downloaded)
            .unwrap_or(false))
    }

    /// Every queue entry.
    pub fn get_download_queue(&self) -> Result<Vec<QueueEntry>> {
        self.db.get_download_queue()
    }

    /// Storage footprint and counts.
    pub fn get_storage_info(&self) -> Result<StorageInfo> {
        let usage = self.db.get_storage_usage()?;
        let downloaded_books_count = self
            .db
            .get_all_books()?
            .iter()
            .filter(|b| b.is_downloaded)
            .count();

        Ok(StorageInfo {
            total_size: usage.total_size,
            counts: usage.counts,
            downloaded_books_count,
        })
    }

    /// Delete a stored book, unless it is being downloaded.
    pub fn delete_book(&self, slug: &str) -> Result<bool> {
        if let Some(active) = self.slot.current().filter(|a| a.slug == slug) {
            return Err(AppError::AlreadyInProgress(active.slug));
        }
        self.db.delete_book(slug)
    }

    /// Remove all stored data, unless a download runs.
    pub fn clear_all_data(&self) -> Result<()> {
        if let Some(active) = self.slot.current() {
            return Err(AppError::AlreadyInProgress(active.slug));
        }
        self.db.clear_all_data()?;
        tracing::info!("Cleared all stored data");
        Ok(())
    }

    /// Repair hadith to chapter links of every downloaded book.
    pub fn repair(&self) -> Result<RepairReport> {
        repair::repair_hadith_chapters(&self.db)
    }
}

fn report_progress(guard: &DownloadGuard, observer: &mut dyn DownloadObserver, progress: f64) {
    guard.set_progress(progress);
    observer.on_progress(guard.slug(), progress);
}
