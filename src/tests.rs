use crate::config::{ApiConfig, Config};
use crate::db::{
    Book, Chapter, Database, Hadith, Localized, Priority, QueueStatus, SCHEMA_VERSION,
};
use crate::download::{DownloadObserver, DownloadState, DownloadSummary, Downloader};
use crate::error::{AppError, Result};
use crate::fetcher::{ContentSource, HttpContentSource};
use crate::server::{self, AppState, format_size};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

// ========== FIXTURES ==========

/// What the fake content API serves.
#[derive(Default)]
struct Remote {
    books: HashMap<String, Book>,
    chapters: HashMap<String, Vec<Chapter>>,
    hadiths: HashMap<(String, i64), Vec<Hadith>>,
    failing_chapter: Option<i64>,
}

#[derive(Clone, Default)]
struct FakeSource {
    remote: Arc<Mutex<Remote>>,
    gate: Option<Arc<Notify>>,
}

impl ContentSource for FakeSource {
    async fn fetch_book(&self, slug: &str) -> Result<Book> {
        self.remote
            .lock()
            .books
            .get(slug)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("book '{}'", slug)))
    }

    async fn fetch_chapters(&self, slug: &str) -> Result<Vec<Chapter>> {
        Ok(self
            .remote
            .lock()
            .chapters
            .get(slug)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_hadiths(&self, slug: &str, chapter_number: i64) -> Result<Vec<Hadith>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let remote = self.remote.lock();
        if remote.failing_chapter == Some(chapter_number) {
            return Err(AppError::Network("connection reset".to_string()));
        }
        Ok(remote
            .hadiths
            .get(&(slug.to_string(), chapter_number))
            .cloned()
            .unwrap_or_default())
    }
}

/// Publish a book with `chapters` chapters of two hadiths each.
///
/// Hadith ids are `base + chapter * 10 + 1` and `+ 2`.
fn publish(remote: &Arc<Mutex<Remote>>, slug: &str, chapters: i64, base: i64) {
    let mut remote = remote.lock();
    remote.books.insert(
        slug.to_string(),
        Book {
            slug: slug.to_string(),
            name: Localized::english(format!("Book {}", slug)),
            author: Some("Imam".to_string()),
            chapters_count: 0,
            hadiths_count: chapters * 2,
            chapters: Vec::new(),
            is_downloaded: false,
            download_date: None,
            last_updated: None,
            remote_revision: Some("r1".to_string()),
        },
    );
    remote.chapters.insert(
        slug.to_string(),
        (1..=chapters)
            .map(|number| Chapter {
                id: 0,
                book_slug: slug.to_string(),
                number,
                title: Localized::english(format!("Chapter {}", number)),
            })
            .collect(),
    );
    for number in 1..=chapters {
        let hadiths = (1..=2)
            .map(|i| Hadith {
                id: base + number * 10 + i,
                book_slug: slug.to_string(),
                // Remote chapter id, replaced by the downloader
                chapter_id: 9000 + number,
                chapter_number: Some(number),
                number: format!("{}", number * 10 + i),
                narrator: Localized::english("Narrated Abu Huraira"),
                text: Localized::english(format!("Hadith {} of chapter {}", i, number)),
            })
            .collect();
        remote.hadiths.insert((slug.to_string(), number), hadiths);
    }
}

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn downloader(source: FakeSource) -> Downloader<FakeSource> {
    Downloader::new(test_db(), source, 3)
}

#[derive(Default)]
struct Recorder {
    progress: Vec<f64>,
    completed: Vec<DownloadSummary>,
    errors: Vec<String>,
}

impl DownloadObserver for Recorder {
    fn on_progress(&mut self, _slug: &str, progress: f64) {
        self.progress.push(progress);
    }

    fn on_complete(&mut self, summary: &DownloadSummary) {
        self.completed.push(summary.clone());
    }

    fn on_error(&mut self, slug: &str, error: &AppError) {
        self.errors.push(format!("{}: {}", slug, error));
    }
}

async fn wait_for_state(downloader: &Downloader<FakeSource>, state: DownloadState) {
    for _ in 0..400 {
        if downloader.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("download never reached {:?}", state);
}

// ========== STORE TESTS ==========

#[test]
fn test_save_and_get_book() {
    let db = test_db();
    let remote = Arc::new(Mutex::new(Remote::default()));
    publish(&remote, "sahih-bukhari", 1, 0);
    let book = remote.lock().books["sahih-bukhari"].clone();

    let saved = db.save_book(&book).unwrap();
    assert!(saved.is_downloaded);
    assert!(saved.download_date.is_some());

    let loaded = db.get_book("sahih-bukhari").unwrap().unwrap();
    assert!(loaded.is_downloaded);
    assert_eq!(loaded.name.best(), Some("Book sahih-bukhari"));
    assert_eq!(loaded.remote_revision.as_deref(), Some("r1"));

    assert!(db.get_book("unknown").unwrap().is_none());
}

#[test]
fn test_save_chapters_keeps_ids() {
    let db = test_db();
    let chapters: Vec<Chapter> = (1..=2)
        .map(|number| Chapter {
            id: 0,
            book_slug: "abu-dawood".to_string(),
            number,
            title: Localized::english("Purification"),
        })
        .collect();

    let first = db.save_chapters("abu-dawood", &chapters).unwrap();
    let second = db.save_chapters("abu-dawood", &chapters).unwrap();
    assert_eq!(first, second);
    assert_ne!(first[0].id, first[1].id);
    assert_eq!(db.get_chapters("abu-dawood").unwrap().len(), 2);
}

#[test]
fn test_chapter_zero_returns_whole_book() {
    let db = test_db();
    let hadiths: Vec<Hadith> = (1..=3)
        .map(|id| Hadith {
            id,
            book_slug: String::new(),
            chapter_id: 7,
            chapter_number: None,
            number: id.to_string(),
            narrator: Localized::default(),
            text: Localized::english("text"),
        })
        .collect();
    assert_eq!(db.save_hadiths("muwatta", &hadiths).unwrap(), 3);

    let stored = db.get_hadiths("muwatta", None).unwrap();
    assert!(stored.iter().all(|h| h.book_slug == "muwatta"));

    assert_eq!(db.get_hadiths("muwatta", Some(7)).unwrap().len(), 3);
    assert_eq!(db.get_hadiths("muwatta", Some(0)).unwrap().len(), 3);
    assert!(db.get_hadiths("muwatta", Some(8)).unwrap().is_empty());
    assert!(db.get_hadiths("unknown", Some(0)).unwrap().is_empty());
}

#[test]
fn test_queue_entry_is_reused_per_slug() {
    let db = test_db();

    let first = db
        .add_to_download_queue("sahih-muslim", Priority::Normal)
        .unwrap();
    assert_eq!(first.status, QueueStatus::Pending);
    assert_eq!(first.attempts, 0);

    let failed = db
        .update_queue_item_status(first.id, QueueStatus::Failed, Some("timeout"))
        .unwrap();
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));

    // Other transitions keep the count and the last error
    let downloading = db
        .update_queue_item_status(first.id, QueueStatus::Downloading, None)
        .unwrap();
    assert_eq!(downloading.attempts, 1);
    assert_eq!(downloading.last_error.as_deref(), Some("timeout"));

    let again = db
        .add_to_download_queue("sahih-muslim", Priority::High)
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, QueueStatus::Pending);
    assert_eq!(again.priority, Priority::High);
    assert_eq!(again.attempts, 1);

    assert_eq!(db.get_download_queue().unwrap().len(), 1);
    assert!(db.remove_from_queue(first.id).unwrap());
    assert!(db.get_queue_item(first.id).unwrap().is_none());
}

#[test]
fn test_update_missing_queue_item() {
    let db = test_db();
    match db.update_queue_item_status(42, QueueStatus::Completed, None) {
        Err(AppError::QueueItemMissing(id)) => assert_eq!(id, 42),
        other => panic!("expected QueueItemMissing, got {:?}", other.map(|e| e.id)),
    }
    assert!(!db.remove_from_queue(42).unwrap());
}

#[test]
fn test_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
        let db = Database::open(&path).unwrap();
        db.add_to_download_queue("nasai", Priority::Normal).unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    assert_eq!(db.init().unwrap(), 0);
    assert_eq!(db.get_download_queue().unwrap()[0].book_slug, "nasai");
}

// ========== DOWNLOAD TESTS ==========

#[tokio::test]
async fn test_download_book_stores_everything() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let downloader = downloader(source);
    let mut recorder = Recorder::default();

    let summary = assert_ok!(
        downloader
            .download_book("sahih-bukhari", Priority::High, &mut recorder)
            .await
    );
    assert_eq!(summary.total_chapters, 3);
    assert_eq!(summary.total_hadiths, 6);
    assert_eq!(recorder.completed, vec![summary]);
    assert!(recorder.errors.is_empty());

    let db = downloader.db();
    assert!(downloader.is_book_downloaded("sahih-bukhari").unwrap());
    assert!(!downloader.is_book_downloaded("sahih-muslim").unwrap());
    assert!(!downloader.is_downloading());
    assert_eq!(downloader.state(), DownloadState::Idle);

    let book = db.get_book("sahih-bukhari").unwrap().unwrap();
    assert_eq!(book.chapters_count, 3);
    assert_eq!(book.chapters.len(), 3);

    // Every hadith points at the stored chapter it was fetched from
    let chapters = db.get_chapters("sahih-bukhari").unwrap();
    for chapter in &chapters {
        let hadiths = db.get_hadiths("sahih-bukhari", Some(chapter.id)).unwrap();
        assert_eq!(hadiths.len(), 2);
        assert!(
            hadiths
                .iter()
                .all(|h| h.chapter_number == Some(chapter.number))
        );
    }

    // A completed download leaves no queue entry
    assert!(downloader.get_download_queue().unwrap().is_empty());
}

#[tokio::test]
async fn test_download_progress_sequence() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let downloader = downloader(source);
    let mut recorder = Recorder::default();

    downloader
        .download_book("sahih-bukhari", Priority::Normal, &mut recorder)
        .await
        .unwrap();

    let expected = [0.0, 10.0, 30.0, 30.0, 50.0, 70.0, 90.0, 100.0];
    assert_eq!(recorder.progress.len(), expected.len());
    for (got, want) in recorder.progress.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "got {} want {}", got, want);
    }
    assert!(recorder.progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_failed_chapter_marks_entry_failed() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    source.remote.lock().failing_chapter = Some(2);
    let downloader = downloader(source);
    let mut recorder = Recorder::default();

    let err = assert_err!(
        downloader
            .download_book("sahih-bukhari", Priority::Normal, &mut recorder)
            .await
    );
    assert!(matches!(err, AppError::Network(_)));
    assert_eq!(recorder.errors.len(), 1);
    assert!(recorder.completed.is_empty());
    assert!(!downloader.is_downloading());

    let queue = downloader.get_download_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, QueueStatus::Failed);
    assert_eq!(queue[0].attempts, 1);
    assert!(queue[0].last_error.as_deref().unwrap().contains("connection reset"));

    // Book and chapters were committed before the failure, hadiths were not
    let db = downloader.db();
    assert!(db.get_book("sahih-bukhari").unwrap().is_some());
    assert_eq!(db.get_chapters("sahih-bukhari").unwrap().len(), 3);
    assert!(db.get_hadiths("sahih-bukhari", None).unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_book_is_not_found() {
    let downloader = downloader(FakeSource::default());

    let err = downloader
        .download_book("unknown", Priority::Normal, &mut ())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(
        downloader.get_download_queue().unwrap()[0].status,
        QueueStatus::Failed
    );
}

#[tokio::test]
async fn test_retry_respects_attempt_ceiling() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-muslim", 1, 0);
    publish(&source.remote, "tirmidhi", 1, 1000);
    let downloader = downloader(source);
    let db = downloader.db();

    let exhausted = db
        .add_to_download_queue("tirmidhi", Priority::Normal)
        .unwrap();
    for _ in 0..3 {
        db.update_queue_item_status(exhausted.id, QueueStatus::Failed, Some("timeout"))
            .unwrap();
    }
    let retryable = db
        .add_to_download_queue("sahih-muslim", Priority::High)
        .unwrap();
    db.update_queue_item_status(retryable.id, QueueStatus::Failed, Some("timeout"))
        .unwrap();

    let entries = downloader.retryable_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].book_slug, "sahih-muslim");

    let outcomes = downloader.retry_failed_downloads(&mut ()).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_success());
    assert!(downloader.is_book_downloaded("sahih-muslim").unwrap());
    assert!(!downloader.is_book_downloaded("tirmidhi").unwrap());

    let queue = downloader.get_download_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].book_slug, "tirmidhi");
    assert_eq!(queue[0].attempts, 3);
}

#[tokio::test]
async fn test_batch_continues_after_failure() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-muslim", 2, 0);
    publish(&source.remote, "ibn-e-majah", 1, 1000);
    let downloader = downloader(source);

    let slugs = vec![
        "sahih-muslim".to_string(),
        "unknown".to_string(),
        "ibn-e-majah".to_string(),
    ];
    let outcomes = downloader
        .batch_download(&slugs, Priority::Normal, &mut ())
        .await;

    let succeeded: Vec<_> = outcomes
        .iter()
        .map(|o| (o.slug.as_str(), o.is_success()))
        .collect();
    assert_eq!(
        succeeded,
        vec![
            ("sahih-muslim", true),
            ("unknown", false),
            ("ibn-e-majah", true)
        ]
    );
    assert_eq!(downloader.get_storage_info().unwrap().downloaded_books_count, 2);
}

#[tokio::test]
async fn test_second_download_is_rejected_while_running() {
    let gate = Arc::new(Notify::new());
    let source = FakeSource {
        gate: Some(gate.clone()),
        ..FakeSource::default()
    };
    publish(&source.remote, "sahih-bukhari", 2, 0);
    publish(&source.remote, "sahih-muslim", 1, 1000);
    let downloader = Arc::new(downloader(source));

    let running = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            downloader
                .download_book("sahih-bukhari", Priority::High, &mut ())
                .await
        })
    };
    wait_for_state(&downloader, DownloadState::FetchingHadiths).await;

    match downloader
        .download_book("sahih-muslim", Priority::Normal, &mut ())
        .await
    {
        Err(AppError::AlreadyInProgress(slug)) => assert_eq!(slug, "sahih-bukhari"),
        other => panic!("expected AlreadyInProgress, got {:?}", other.map(|s| s.slug)),
    }
    // The rejected request never reached the store
    let queue = downloader.get_download_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].book_slug, "sahih-bukhari");
    assert_eq!(queue[0].status, QueueStatus::Downloading);

    assert!(matches!(
        downloader.delete_book("sahih-bukhari"),
        Err(AppError::AlreadyInProgress(_))
    ));
    assert!(matches!(
        downloader.clear_all_data(),
        Err(AppError::AlreadyInProgress(_))
    ));

    let current = downloader.current().unwrap();
    assert_eq!(current.slug, "sahih-bukhari");
    assert!(current.progress >= 30.0);

    // One permit per chapter
    gate.notify_one();
    gate.notify_one();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.total_hadiths, 4);
    assert!(!downloader.is_downloading());

    // The token is free again; the gate needs a permit for the next chapter
    gate.notify_one();
    assert_ok!(
        downloader
            .download_book("sahih-muslim", Priority::Normal, &mut ())
            .await
    );
}

#[tokio::test]
async fn test_cancel_download() {
    let gate = Arc::new(Notify::new());
    let source = FakeSource {
        gate: Some(gate),
        ..FakeSource::default()
    };
    publish(&source.remote, "sahih-bukhari", 2, 0);
    let downloader = Arc::new(downloader(source));

    assert!(!downloader.cancel_download().unwrap());

    let running = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            let mut recorder = Recorder::default();
            let result = downloader
                .download_book("sahih-bukhari", Priority::Normal, &mut recorder)
                .await;
            (result, recorder)
        })
    };
    wait_for_state(&downloader, DownloadState::FetchingHadiths).await;

    assert!(downloader.cancel_download().unwrap());
    assert_eq!(downloader.state(), DownloadState::Cancelled);
    // The token is released once the task unwinds, not by the cancel call
    assert!(downloader.is_downloading());
    // Cancelling twice is a no-op
    assert!(!downloader.cancel_download().unwrap());

    let (result, recorder) = running.await.unwrap();
    assert!(matches!(result, Err(AppError::Cancelled(_))));
    assert_eq!(recorder.errors.len(), 1);
    assert!(!downloader.is_downloading());

    let queue = downloader.get_download_queue().unwrap();
    assert_eq!(queue[0].status, QueueStatus::Cancelled);
    assert_eq!(queue[0].attempts, 0);
    assert!(downloader.retryable_entries().unwrap().is_empty());

    // Nothing committed is rolled back
    let db = downloader.db();
    assert!(db.get_book("sahih-bukhari").unwrap().is_some());
    assert!(db.get_hadiths("sahih-bukhari", None).unwrap().is_empty());
}

#[tokio::test]
async fn test_update_downloads_changed_books() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 1, 0);
    publish(&source.remote, "sahih-muslim", 1, 1000);
    let remote = source.remote.clone();
    let downloader = downloader(source);

    for slug in ["sahih-bukhari", "sahih-muslim"] {
        downloader
            .download_book(slug, Priority::Normal, &mut ())
            .await
            .unwrap();
    }

    let report = downloader.update_downloaded_books(&mut ()).await.unwrap();
    assert_eq!(report.checked, 2);
    assert!(report.updated.is_empty());
    assert!(report.failed.is_empty());

    {
        let mut remote = remote.lock();
        if let Some(book) = remote.books.get_mut("sahih-muslim") {
            book.remote_revision = Some("r2".to_string());
        }
        remote.books.remove("sahih-bukhari");
    }

    let report = downloader.update_downloaded_books(&mut ()).await.unwrap();
    assert_eq!(report.updated, vec!["sahih-muslim".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].slug, "sahih-bukhari");

    let stored = downloader.db().get_book("sahih-muslim").unwrap().unwrap();
    assert_eq!(stored.remote_revision.as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_update_replaces_content_of_shrunk_book() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let remote = source.remote.clone();
    let downloader = downloader(source);
    downloader
        .download_book("sahih-bukhari", Priority::Normal, &mut ())
        .await
        .unwrap();
    let before = downloader.db().get_chapters("sahih-bukhari").unwrap();

    // The remote drops chapter 3 and reworks chapter 2
    publish(&remote, "sahih-bukhari", 2, 0);
    {
        let mut remote = remote.lock();
        if let Some(book) = remote.books.get_mut("sahih-bukhari") {
            book.remote_revision = Some("r2".to_string());
        }
        if let Some(hadiths) = remote.hadiths.get_mut(&("sahih-bukhari".to_string(), 2)) {
            hadiths.truncate(1);
        }
    }

    let mut recorder = Recorder::default();
    let report = downloader
        .update_downloaded_books(&mut recorder)
        .await
        .unwrap();
    assert_eq!(report.updated, vec!["sahih-bukhari".to_string()]);
    let summary = &recorder.completed[0];
    assert_eq!(summary.total_chapters, 2);
    assert_eq!(summary.total_hadiths, 3);

    let db = downloader.db();
    let chapters = db.get_chapters("sahih-bukhari").unwrap();
    assert_eq!(chapters.len(), summary.total_chapters);
    assert_eq!(chapters[..], before[..2]);
    assert_eq!(
        db.get_hadiths("sahih-bukhari", None).unwrap().len(),
        summary.total_hadiths
    );
    assert_eq!(db.get_hadiths("sahih-bukhari", Some(chapters[1].id)).unwrap().len(), 1);

    let book = db.get_book("sahih-bukhari").unwrap().unwrap();
    let referenced: Vec<i64> = book.chapters.iter().map(|c| c.id).collect();
    let stored: Vec<i64> = chapters.iter().map(|c| c.id).collect();
    assert_eq!(referenced, stored);

    assert_eq!(downloader.repair().unwrap().hadiths_rewritten, 0);
}

#[tokio::test]
async fn test_same_hadith_ids_in_two_books() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 1, 0);
    publish(&source.remote, "sahih-muslim", 1, 0);
    let downloader = downloader(source);

    for slug in ["sahih-bukhari", "sahih-muslim"] {
        let summary = downloader
            .download_book(slug, Priority::Normal, &mut ())
            .await
            .unwrap();
        assert_eq!(summary.total_hadiths, 2);
    }

    let db = downloader.db();
    let bukhari = db.get_hadiths("sahih-bukhari", None).unwrap();
    let muslim = db.get_hadiths("sahih-muslim", None).unwrap();
    assert_eq!(bukhari.len(), 2);
    assert_eq!(muslim.len(), 2);
    assert_eq!(
        bukhari.iter().map(|h| h.id).collect::<Vec<_>>(),
        muslim.iter().map(|h| h.id).collect::<Vec<_>>()
    );
    assert!(bukhari.iter().all(|h| h.book_slug == "sahih-bukhari"));

    // Deleting one book keeps the other's rows
    assert!(downloader.delete_book("sahih-bukhari").unwrap());
    assert_eq!(db.get_hadiths("sahih-muslim", None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_book_cascades() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 2, 0);
    publish(&source.remote, "sahih-muslim", 1, 1000);
    let downloader = downloader(source);
    for slug in ["sahih-bukhari", "sahih-muslim"] {
        downloader
            .download_book(slug, Priority::Normal, &mut ())
            .await
            .unwrap();
    }

    assert!(downloader.delete_book("sahih-bukhari").unwrap());
    assert!(!downloader.delete_book("sahih-bukhari").unwrap());

    let db = downloader.db();
    assert!(db.get_book("sahih-bukhari").unwrap().is_none());
    assert!(db.get_chapters("sahih-bukhari").unwrap().is_empty());
    assert!(db.get_hadiths("sahih-bukhari", None).unwrap().is_empty());
    assert_eq!(db.get_hadiths("sahih-muslim", None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_storage_info_and_clear() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let downloader = downloader(source);

    let empty = downloader.get_storage_info().unwrap();
    assert_eq!(empty.total_size, 0);

    downloader
        .download_book("sahih-bukhari", Priority::Normal, &mut ())
        .await
        .unwrap();
    downloader
        .db()
        .add_to_download_queue("sahih-muslim", Priority::Normal)
        .unwrap();

    let info = downloader.get_storage_info().unwrap();
    assert!(info.total_size > 0);
    assert_eq!(info.counts.books, 1);
    assert_eq!(info.counts.chapters, 3);
    assert_eq!(info.counts.hadiths, 6);
    assert_eq!(info.counts.queue, 1);
    assert_eq!(info.downloaded_books_count, 1);

    downloader.clear_all_data().unwrap();
    let cleared = downloader.get_storage_info().unwrap();
    assert_eq!(cleared.total_size, 0);
    assert_eq!(cleared.counts.books, 0);
    assert_eq!(cleared.counts.queue, 0);
}

// ========== REPAIR TESTS ==========

#[tokio::test]
async fn test_repair_after_download_is_noop() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let downloader = downloader(source);
    downloader
        .download_book("sahih-bukhari", Priority::Normal, &mut ())
        .await
        .unwrap();

    let report = downloader.repair().unwrap();
    assert_eq!(report.books, 1);
    assert_eq!(report.hadiths_checked, 6);
    assert_eq!(report.hadiths_rewritten, 0);
}

#[tokio::test]
async fn test_repair_fixes_legacy_links() {
    let source = FakeSource::default();
    publish(&source.remote, "sahih-muslim", 2, 1000);
    publish(&source.remote, "sahih-bukhari", 3, 0);
    let downloader = downloader(source);
    // Download another book first so chapter ids and numbers differ
    for slug in ["sahih-muslim", "sahih-bukhari"] {
        downloader
            .download_book(slug, Priority::Normal, &mut ())
            .await
            .unwrap();
    }
    let db = downloader.db();

    let chapter_two = db
        .get_chapters("sahih-bukhari")
        .unwrap()
        .into_iter()
        .find(|c| c.number == 2)
        .unwrap();
    assert_ne!(chapter_two.id, 2);

    // Legacy rows stored the remote chapter number as the chapter id
    assert!(db.update_hadith_chapter("sahih-bukhari", 21, 2, None).unwrap());
    assert!(db.update_hadith_chapter("sahih-bukhari", 22, 2, None).unwrap());
    assert!(!db.update_hadith_chapter("sahih-muslim", 21, 2, None).unwrap());
    assert!(
        db.get_hadiths("sahih-bukhari", Some(chapter_two.id))
            .unwrap()
            .is_empty()
    );

    let report = downloader.repair().unwrap();
    assert_eq!(report.books, 2);
    assert_eq!(report.hadiths_rewritten, 2);

    let repaired = db.get_hadiths("sahih-bukhari", Some(chapter_two.id)).unwrap();
    assert_eq!(repaired.len(), 2);
    assert!(repaired.iter().all(|h| h.chapter_number == Some(2)));

    assert_eq!(downloader.repair().unwrap().hadiths_rewritten, 0);
}

// ========== CONFIG TESTS ==========

#[test]
fn test_config_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.download.max_attempts, 3);
    assert!(config.download.repair_on_start);
    assert_eq!(config.api.page_size, 1000);
    assert!(config.api.api_key.is_none());

    let generated = Config::parse(&Config::generate_default()).unwrap();
    assert_eq!(generated.server.bind, config.server.bind);
}

#[test]
fn test_config_rejects_zero_attempts() {
    let result = Config::parse("[download]\nmax_attempts = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn test_format_size() {
    assert_eq!(format_size(512), "512 B");
    assert_eq!(format_size(2048), "2.00 KB");
    assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
}

// ========== HTTP TESTS ==========

async fn spawn_server() -> String {
    let config = Config::default();
    // Nothing listens on the content API address
    let source = HttpContentSource::new(&ApiConfig {
        base_url: "http://127.0.0.1:9/".to_string(),
        ..ApiConfig::default()
    })
    .unwrap();
    let downloader = Downloader::new(test_db(), source, config.download.max_attempts);
    let app = server::create_router(AppState::new(downloader));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_http_routes() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let books: serde_json::Value = client
        .get(format!("{}/api/books", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(books, serde_json::json!([]));

    let missing = client
        .get(format!("{}/api/books/unknown", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let deleted = client
        .delete(format!("{}/api/books/unknown", base))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NOT_FOUND);

    let current: serde_json::Value = client
        .get(format!("{}/api/downloads/current", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["state"], "idle");

    let storage: serde_json::Value = client
        .get(format!("{}/api/storage", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(storage["total_size"], 0);
    assert_eq!(storage["total_size_human"], "0 B");

    let retry = client
        .post(format!("{}/api/downloads/retry", base))
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), reqwest::StatusCode::ACCEPTED);

    let cancel: serde_json::Value = client
        .delete(format!("{}/api/downloads/current", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancel["cancelled"], false);
}
