use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

const BOOK_COLUMNS: &str = "slug, name_json, author, chapters_count, hadiths_count, chapters_json,
     is_downloaded, download_date, last_updated, remote_revision";

const HADITH_COLUMNS: &str =
    "id, book_slug, chapter_id, chapter_number, number, narrator_json, text_json";

const QUEUE_COLUMNS: &str =
    "id, book_slug, priority, status, attempts, last_error, created_at, updated_at";

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Store(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Store(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init()?;
        Ok(db)
    }

    /// Bring the schema up to date.
    ///
    /// Called by the constructors; calling it again is a no-op once the
    /// schema is current. Returns the number of migrations applied.
    pub fn init(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        super::migrations::apply_pending(&mut conn)
            .map_err(|e| AppError::Store(format!("Failed to migrate schema: {}", e)))
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock();
        super::migrations::current_version(&conn)
            .map_err(|e| AppError::Store(format!("Failed to read schema version: {}", e)))
    }

    // ========== BOOK OPERATIONS ==========

    /// Save or replace a downloaded book.
    ///
    /// Stamps the download timestamps and marks the book as downloaded.
    pub fn save_book(&self, book: &Book) -> Result<Book> {
        let now = now_timestamp();
        let mut stored = book.clone();
        stored.is_downloaded = true;
        stored.download_date = Some(now);
        stored.last_updated = Some(now);

        let name_json = to_json(&stored.name)?;
        let chapters_json = to_json(&stored.chapters)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books
             (slug, name_json, author, chapters_count, hadiths_count, chapters_json,
              is_downloaded, download_date, last_updated, remote_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (slug) DO UPDATE SET
                name_json = excluded.name_json,
                author = excluded.author,
                chapters_count = excluded.chapters_count,
                hadiths_count = excluded.hadiths_count,
                chapters_json = excluded.chapters_json,
                is_downloaded = excluded.is_downloaded,
                download_date = excluded.download_date,
                last_updated = excluded.last_updated,
                remote_revision = excluded.remote_revision",
            params![
                stored.slug,
                name_json,
                stored.author,
                stored.chapters_count,
                stored.hadiths_count,
                chapters_json,
                stored.is_downloaded,
                stored.download_date,
                stored.last_updated,
                stored.remote_revision,
            ],
        )
        .map_err(|e| AppError::Store(format!("Failed to save book: {}", e)))?;

        Ok(stored)
    }

    /// Get book by slug.
    pub fn get_book(&self, slug: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM books WHERE slug = ?1", BOOK_COLUMNS),
            params![slug],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Store(format!("Failed to get book: {}", e)))
    }

    /// Get all stored books.
    pub fn get_all_books(&self) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM books ORDER BY slug", BOOK_COLUMNS))
            .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map([], Self::row_to_book)
            .map_err(|e| AppError::Store(format!("Failed to get all books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Store(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Delete a book together with its chapters and hadiths.
    ///
    /// All three deletions commit together or not at all.
    pub fn delete_book(&self, slug: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Store(format!("Failed to begin transaction: {}", e)))?;

        tx.execute("DELETE FROM hadiths WHERE book_slug = ?1", params![slug])
            .map_err(|e| AppError::Store(format!("Failed to delete hadiths: {}", e)))?;
        tx.execute("DELETE FROM chapters WHERE book_slug = ?1", params![slug])
            .map_err(|e| AppError::Store(format!("Failed to delete chapters: {}", e)))?;
        let rows = tx
            .execute("DELETE FROM books WHERE slug = ?1", params![slug])
            .map_err(|e| AppError::Store(format!("Failed to delete book: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Store(format!("Failed to commit book deletion: {}", e)))?;
        Ok(rows > 0)
    }

    /// Helper to convert a row to Book.
    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            slug: row.get(0)?,
            name: json_column(row, 1)?,
            author: row.get(2)?,
            chapters_count: row.get(3)?,
            hadiths_count: row.get(4)?,
            chapters: json_column(row, 5)?,
            is_downloaded: row.get(6)?,
            download_date: row.get(7)?,
            last_updated: row.get(8)?,
            remote_revision: row.get(9)?,
        })
    }

    // ========== CHAPTER OPERATIONS ==========

    /// Save chapters of a book in one transaction.
    ///
    /// Chapters are keyed by `(book_slug, number)`, so saving the same chapter
    /// twice keeps its id. Returns the stored chapters, in input order, with
    /// their store-assigned ids.
    pub fn save_chapters(&self, slug: &str, chapters: &[Chapter]) -> Result<Vec<Chapter>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Store(format!("Failed to begin transaction: {}", e)))?;

        let mut stored = Vec::with_capacity(chapters.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chapters (book_slug, number, title_json)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (book_slug, number) DO UPDATE SET
                        title_json = excluded.title_json
                     RETURNING id",
                )
                .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

            for chapter in chapters {
                let title_json = to_json(&chapter.title)?;
                let id: i64 = stmt
                    .query_row(params![slug, chapter.number, title_json], |row| row.get(0))
                    .map_err(|e| AppError::Store(format!("Failed to save chapter: {}", e)))?;

                stored.push(Chapter {
                    id,
                    book_slug: slug.to_string(),
                    number: chapter.number,
                    title: chapter.title.clone(),
                });
            }
        }

        tx.commit()
            .map_err(|e| AppError::Store(format!("Failed to commit chapters: {}", e)))?;
        Ok(stored)
    }

    /// Get chapters of a book, ordered by number.
    pub fn get_chapters(&self, slug: &str) -> Result<Vec<Chapter>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, book_slug, number, title_json
                 FROM chapters WHERE book_slug = ?1
                 ORDER BY number",
            )
            .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

        let chapters = stmt
            .query_map(params![slug], Self::row_to_chapter)
            .map_err(|e| AppError::Store(format!("Failed to get chapters: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Store(format!("Failed to collect chapters: {}", e)))?;

        Ok(chapters)
    }

    fn row_to_chapter(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chapter> {
        Ok(Chapter {
            id: row.get(0)?,
            book_slug: row.get(1)?,
            number: row.get(2)?,
            title: json_column(row, 3)?,
        })
    }

    // ========== HADITH OPERATIONS ==========

    /// Save hadiths of a book in one transaction.
    ///
    /// Every row is stamped with `slug`. Hadiths are keyed by `(book_slug, id)`.
    /// Returns the number of rows written.
    pub fn save_hadiths(&self, slug: &str, hadiths: &[Hadith]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Store(format!("Failed to begin transaction: {}", e)))?;

        insert_hadiths(&tx, slug, hadiths)?;

        tx.commit()
            .map_err(|e| AppError::Store(format!("Failed to commit hadiths: {}", e)))?;
        Ok(hadiths.len())
    }

    /// Replace the downloaded content of a book in one transaction.
    ///
    /// Chapters of the book whose id is not in `chapter_ids` are removed, every
    /// stored hadith of the book is replaced by `hadiths`. Returns the number
    /// of hadiths written.
    pub fn replace_book_content(
        &self,
        slug: &str,
        chapter_ids: &[i64],
        hadiths: &[Hadith],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Store(format!("Failed to begin transaction: {}", e)))?;

        let stale: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT id FROM chapters WHERE book_slug = ?1")
                .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;
            stmt.query_map(params![slug], |row| row.get(0))
                .map_err(|e| AppError::Store(format!("Failed to get chapters: {}", e)))?
                .collect::<std::result::Result<Vec<i64>, _>>()
                .map_err(|e| AppError::Store(format!("Failed to collect chapters: {}", e)))?
                .into_iter()
                .filter(|id| !chapter_ids.contains(id))
                .collect()
        };
        for id in &stale {
            tx.execute("DELETE FROM chapters WHERE id = ?1", params![id])
                .map_err(|e| AppError::Store(format!("Failed to delete chapter: {}", e)))?;
        }

        tx.execute("DELETE FROM hadiths WHERE book_slug = ?1", params![slug])
            .map_err(|e| AppError::Store(format!("Failed to delete hadiths: {}", e)))?;
        insert_hadiths(&tx, slug, hadiths)?;

        tx.commit()
            .map_err(|e| AppError::Store(format!("Failed to commit book content: {}", e)))?;

        if !stale.is_empty() {
            tracing::debug!(slug, removed = stale.len(), "Removed chapters gone from the remote");
        }
        Ok(hadiths.len())
    }

    /// Get hadiths of a book, optionally restricted to one chapter.
    ///
    /// Rows written before chapter ids were stamped correctly may not match
    /// any chapter. For those, a lookup of chapter `0` that finds nothing
    /// returns every hadith of the book instead.
    pub fn get_hadiths(&self, slug: &str, chapter_id: Option<i64>) -> Result<Vec<Hadith>> {
        let Some(chapter_id) = chapter_id else {
            return self.query_hadiths(
                &format!(
                    "SELECT {} FROM hadiths WHERE book_slug = ?1 ORDER BY id",
                    HADITH_COLUMNS
                ),
                params![slug],
            );
        };

        let hadiths = self.query_hadiths(
            &format!(
                "SELECT {} FROM hadiths WHERE book_slug = ?1 AND chapter_id = ?2 ORDER BY id",
                HADITH_COLUMNS
            ),
            params![slug, chapter_id],
        )?;

        if hadiths.is_empty() && chapter_id == 0 {
            tracing::debug!(slug, "No hadiths for chapter 0, returning whole book");
            return self.get_hadiths(slug, None);
        }

        Ok(hadiths)
    }

    fn query_hadiths(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Hadith>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

        let hadiths = stmt
            .query_map(params, Self::row_to_hadith)
            .map_err(|e| AppError::Store(format!("Failed to get hadiths: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Store(format!("Failed to collect hadiths: {}", e)))?;

        Ok(hadiths)
    }

    /// Point a hadith of a book at another chapter.
    pub fn update_hadith_chapter(
        &self,
        slug: &str,
        id: i64,
        chapter_id: i64,
        chapter_number: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE hadiths SET chapter_id = ?3, chapter_number = ?4
                 WHERE book_slug = ?1 AND id = ?2",
                params![slug, id, chapter_id, chapter_number],
            )
            .map_err(|e| AppError::Store(format!("Failed to update hadith: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_hadith(row: &rusqlite::Row<'_>) -> rusqlite::Result<Hadith> {
        Ok(Hadith {
            id: row.get(0)?,
            book_slug: row.get(1)?,
            chapter_id: row.get(2)?,
            chapter_number: row.get(3)?,
            number: row.get(4)?,
            narrator: json_column(row, 5)?,
            text: json_column(row, 6)?,
        })
    }

    // ========== QUEUE OPERATIONS ==========

    /// Register a download request.
    ///
    /// A slug has at most one queue row: registering it again resets the
    /// existing row to `pending` and keeps its attempt count.
    pub fn add_to_download_queue(&self, slug: &str, priority: Priority) -> Result<QueueEntry> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "INSERT INTO download_queue
                 (book_slug, priority, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)
                 ON CONFLICT (book_slug) DO UPDATE SET
                    priority = excluded.priority,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                 RETURNING {}",
                QUEUE_COLUMNS
            ),
            params![slug, priority, QueueStatus::Pending, now_timestamp()],
            Self::row_to_queue_entry,
        )
        .map_err(|e| AppError::Store(format!("Failed to add queue item: {}", e)))
    }

    /// Get every queue entry, oldest first.
    pub fn get_download_queue(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM download_queue ORDER BY created_at, id",
                QUEUE_COLUMNS
            ))
            .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt
            .query_map([], Self::row_to_queue_entry)
            .map_err(|e| AppError::Store(format!("Failed to get queue: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Store(format!("Failed to collect queue: {}", e)))?;

        Ok(entries)
    }

    /// Get one queue entry.
    pub fn get_queue_item(&self, id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM download_queue WHERE id = ?1", QUEUE_COLUMNS),
            params![id],
            Self::row_to_queue_entry,
        )
        .optional()
        .map_err(|e| AppError::Store(format!("Failed to get queue item: {}", e)))
    }

    /// Move a queue entry to another status.
    ///
    /// A transition to `failed` increments the attempt count. The error, when
    /// given, replaces the stored one.
    pub fn update_queue_item_status(
        &self,
        id: i64,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<QueueEntry> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "UPDATE download_queue SET
                    status = ?2,
                    attempts = attempts + CASE WHEN ?2 = 'failed' THEN 1 ELSE 0 END,
                    last_error = COALESCE(?3, last_error),
                    updated_at = ?4
                 WHERE id = ?1
                 RETURNING {}",
                QUEUE_COLUMNS
            ),
            params![id, status, error, now_timestamp()],
            Self::row_to_queue_entry,
        )
        .optional()
        .map_err(|e| AppError::Store(format!("Failed to update queue item: {}", e)))?
        .ok_or(AppError::QueueItemMissing(id))
    }

    /// Remove a queue entry.
    pub fn remove_from_queue(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM download_queue WHERE id = ?1", params![id])
            .map_err(|e| AppError::Store(format!("Failed to remove queue item: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
        Ok(QueueEntry {
            id: row.get(0)?,
            book_slug: row.get(1)?,
            priority: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    // ========== STORAGE OPERATIONS ==========

    /// Approximate storage footprint.
    ///
    /// The size is the serialized JSON length of every row, which tracks the
    /// real on-disk size closely enough for quota displays.
    pub fn get_storage_usage(&self) -> Result<StorageUsage> {
        let conn = self.conn.lock();

        let (books, books_size) = measure(
            &conn,
            &format!("SELECT {} FROM books", BOOK_COLUMNS),
            Self::row_to_book,
        )?;
        let (chapters, chapters_size) = measure(
            &conn,
            "SELECT id, book_slug, number, title_json FROM chapters",
            Self::row_to_chapter,
        )?;
        let (hadiths, hadiths_size) = measure(
            &conn,
            &format!("SELECT {} FROM hadiths", HADITH_COLUMNS),
            Self::row_to_hadith,
        )?;
        let (queue, queue_size) = measure(
            &conn,
            &format!("SELECT {} FROM download_queue", QUEUE_COLUMNS),
            Self::row_to_queue_entry,
        )?;

        Ok(StorageUsage {
            total_size: books_size + chapters_size + hadiths_size + queue_size,
            counts: CollectionCounts {
                books,
                chapters,
                hadiths,
                queue,
            },
        })
    }

    /// Empty all four collections in one transaction.
    pub fn clear_all_data(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Store(format!("Failed to begin transaction: {}", e)))?;

        tx.execute_batch(
            "DELETE FROM hadiths;
             DELETE FROM chapters;
             DELETE FROM books;
             DELETE FROM download_queue;",
        )
        .map_err(|e| AppError::Store(format!("Failed to clear data: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Store(format!("Failed to commit clear: {}", e)))?;
        Ok(())
    }
}

fn insert_hadiths(tx: &rusqlite::Transaction<'_>, slug: &str, hadiths: &[Hadith]) -> Result<()> {
    let mut stmt = tx
        .prepare(
            "INSERT INTO hadiths
             (id, book_slug, chapter_id, chapter_number, number, narrator_json, text_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (book_slug, id) DO UPDATE SET
                chapter_id = excluded.chapter_id,
                chapter_number = excluded.chapter_number,
                number = excluded.number,
                narrator_json = excluded.narrator_json,
                text_json = excluded.text_json",
        )
        .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

    for hadith in hadiths {
        stmt.execute(params![
            hadith.id,
            slug,
            hadith.chapter_id,
            hadith.chapter_number,
            hadith.number,
            to_json(&hadith.narrator)?,
            to_json(&hadith.text)?,
        ])
        .map_err(|e| AppError::Store(format!("Failed to save hadith: {}", e)))?;
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Internal(format!("Failed to serialize column: {}", e)))
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Count rows and sum their serialized size.
fn measure<T, F>(conn: &Connection, sql: &str, map: F) -> Result<(u64, u64)>
where
    T: Serialize,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::Store(format!("Failed to prepare query: {}", e)))?;

    let mut count = 0u64;
    let mut size = 0u64;
    for item in stmt
        .query_map([], map)
        .map_err(|e| AppError::Store(format!("Failed to measure storage: {}", e)))?
    {
        let item = item.map_err(|e| AppError::Store(format!("Failed to read row: {}", e)))?;
        count += 1;
        size += serde_json::to_vec(&item)
            .map_err(|e| AppError::Internal(format!("Failed to serialize row: {}", e)))?
            .len() as u64;
    }

    Ok((count, size))
}
