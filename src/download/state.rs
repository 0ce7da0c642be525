//! Download token and status tracking.

use crate::error::{AppError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Step of a book download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    /// No download running.
    Idle,
    /// Token taken, queue entry being registered.
    Queued,
    /// Fetching book metadata and chapter list.
    FetchingMetadata,
    /// Fetching hadiths chapter by chapter.
    FetchingHadiths,
    /// Writing hadiths to the store.
    Persisting,
    /// Finished.
    Completed,
    /// Aborted by an error.
    Failed,
    /// Aborted by the user.
    Cancelled,
}

impl DownloadState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// Snapshot of the running download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    /// Target book.
    pub slug: String,
    /// Current step.
    pub state: DownloadState,
    /// Progress in percent (0.0 - 100.0).
    pub progress: f64,
    /// Queue entry of this download, once registered.
    pub queue_id: Option<i64>,
}

struct Active {
    status: DownloadStatus,
    cancel: CancellationToken,
}

/// Slot holding the single download token.
#[derive(Clone, Default)]
pub(crate) struct DownloadSlot {
    inner: Arc<Mutex<Option<Active>>>,
}

impl DownloadSlot {
    /// Take the token for `slug`, or fail if another download holds it.
    pub(crate) fn try_acquire(&self, slug: &str) -> Result<DownloadGuard> {
        let mut slot = self.inner.lock();
        if let Some(active) = slot.as_ref() {
            return Err(AppError::AlreadyInProgress(active.status.slug.clone()));
        }

        let cancel = CancellationToken::new();
        *slot = Some(Active {
            status: DownloadStatus {
                slug: slug.to_string(),
                state: DownloadState::Queued,
                progress: 0.0,
                queue_id: None,
            },
            cancel: cancel.clone(),
        });

        Ok(DownloadGuard {
            slot: self.clone(),
            slug: slug.to_string(),
            cancel,
        })
    }

    pub(crate) fn current(&self) -> Option<DownloadStatus> {
        self.inner.lock().as_ref().map(|a| a.status.clone())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Signal cancellation to the holder of the token.
    ///
    /// Returns the cancelled download, or `None` when nothing was running,
    /// the download was already cancelled or finished, or it is writing its
    /// hadiths.
    pub(crate) fn cancel(&self) -> Option<DownloadStatus> {
        let mut slot = self.inner.lock();
        let active = slot.as_mut()?;
        if active.status.state.is_terminal() || active.status.state == DownloadState::Persisting {
            return None;
        }

        active.cancel.cancel();
        active.status.state = DownloadState::Cancelled;
        active.status.progress = 0.0;
        Some(active.status.clone())
    }

    fn update(&self, f: impl FnOnce(&mut DownloadStatus)) {
        if let Some(active) = self.inner.lock().as_mut() {
            if active.status.state != DownloadState::Cancelled {
                f(&mut active.status);
            }
        }
    }
}

/// Ownership of the download token.
///
/// Dropping the guard frees the slot, whichever way the download ends.
pub struct DownloadGuard {
    slot: DownloadSlot,
    slug: String,
    cancel: CancellationToken,
}

impl DownloadGuard {
    /// Target book.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_state(&self, state: DownloadState) {
        self.slot.update(|s| s.state = state);
    }

    pub(crate) fn set_progress(&self, progress: f64) {
        self.slot.update(|s| s.progress = progress);
    }

    pub(crate) fn set_queue_id(&self, id: i64) {
        self.slot.update(|s| s.queue_id = Some(id));
    }

    /// Run `fut` unless cancellation is requested first.
    ///
    /// On cancellation the future is dropped, which aborts an in-flight request.
    pub(crate) async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled(self.slug.clone())),
            result = fut => result,
        }
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        *self.slot.inner.lock() = None;
    }
}
