//! Versioned schema migrations.
//!
//! Steps run in version order at open time, each in its own transaction, and
//! the reached version is recorded in `PRAGMA user_version`. Every step must be
//! safe to run against a database where it was already applied.

use rusqlite::{Connection, Transaction};

/// One schema step.
pub struct Migration {
    /// Version reached once this step is applied.
    pub version: u32,
    /// Short name, for logs.
    pub name: &'static str,
    /// Step body.
    pub apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

/// Every migration, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "content_tables",
        apply: content_tables,
    },
    Migration {
        version: 2,
        name: "download_queue",
        apply: download_queue,
    },
    Migration {
        version: 3,
        name: "hadith_chapter_number",
        apply: hadith_chapter_number,
    },
    Migration {
        version: 4,
        name: "hadith_book_scope",
        apply: hadith_book_scope,
    },
];

/// Latest schema version.
pub const SCHEMA_VERSION: u32 = 4;

fn content_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            slug TEXT PRIMARY KEY,
            name_json TEXT NOT NULL,
            author TEXT,
            chapters_count INTEGER NOT NULL DEFAULT 0,
            hadiths_count INTEGER NOT NULL DEFAULT 0,
            chapters_json TEXT NOT NULL DEFAULT '[]',
            is_downloaded INTEGER NOT NULL DEFAULT 0,
            download_date INTEGER,
            last_updated INTEGER,
            remote_revision TEXT
        );

        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_slug TEXT NOT NULL,
            number INTEGER NOT NULL,
            title_json TEXT NOT NULL,
            UNIQUE (book_slug, number)
        );

        CREATE TABLE IF NOT EXISTS hadiths (
            id INTEGER PRIMARY KEY,
            book_slug TEXT NOT NULL,
            chapter_id INTEGER NOT NULL,
            number TEXT NOT NULL,
            narrator_json TEXT NOT NULL,
            text_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chapters_book ON chapters(book_slug);
        CREATE INDEX IF NOT EXISTS idx_hadiths_book ON hadiths(book_slug);
        "#,
    )
}

fn download_queue(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS download_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_slug TEXT NOT NULL UNIQUE,
            priority TEXT NOT NULL DEFAULT 'normal',
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_status ON download_queue(status);
        "#,
    )
}

fn hadith_chapter_number(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !has_column(tx, "hadiths", "chapter_number")? {
        tx.execute_batch("ALTER TABLE hadiths ADD COLUMN chapter_number INTEGER")?;
    }
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_hadiths_book_chapter ON hadiths(book_slug, chapter_id)",
    )
}

/// Key hadiths on `(book_slug, id)`: remote ids are only unique within a book.
///
/// SQLite cannot change a primary key in place, so the table is rebuilt.
fn hadith_book_scope(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if primary_key(tx, "hadiths")? == ["book_slug", "id"] {
        return Ok(());
    }
    tx.execute_batch(
        r#"
        CREATE TABLE hadiths_scoped (
            id INTEGER NOT NULL,
            book_slug TEXT NOT NULL,
            chapter_id INTEGER NOT NULL,
            chapter_number INTEGER,
            number TEXT NOT NULL,
            narrator_json TEXT NOT NULL,
            text_json TEXT NOT NULL,
            PRIMARY KEY (book_slug, id)
        );

        INSERT INTO hadiths_scoped
            (id, book_slug, chapter_id, chapter_number, number, narrator_json, text_json)
        SELECT id, book_slug, chapter_id, chapter_number, number, narrator_json, text_json
        FROM hadiths;

        DROP TABLE hadiths;
        ALTER TABLE hadiths_scoped RENAME TO hadiths;

        CREATE INDEX IF NOT EXISTS idx_hadiths_book ON hadiths(book_slug);
        CREATE INDEX IF NOT EXISTS idx_hadiths_book_chapter ON hadiths(book_slug, chapter_id);
        "#,
    )
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Primary key columns of `table`, in key order.
fn primary_key(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut columns = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    columns.retain(|(pk, _)| *pk > 0);
    columns.sort_unstable();
    Ok(columns.into_iter().map(|(_, name)| name).collect())
}

/// Version recorded in the database header.
pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Apply every migration newer than the recorded version.
///
/// Returns the number of steps applied.
pub(crate) fn apply_pending(conn: &mut Connection) -> rusqlite::Result<usize> {
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
        applied += 1;
    }

    Ok(applied)
}
