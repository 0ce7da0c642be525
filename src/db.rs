mod migrations;
mod schema;

pub use migrations::{MIGRATIONS, Migration, SCHEMA_VERSION};
pub use schema::Database;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Text carried in the languages the content API serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Localized {
    /// English variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
    /// Arabic variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ar: Option<String>,
    /// Urdu variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ur: Option<String>,
}

impl Localized {
    /// Text with only the English variant set.
    pub fn english(text: impl Into<String>) -> Self {
        Self {
            en: Some(text.into()),
            ..Self::default()
        }
    }

    /// First available variant, English preferred.
    pub fn best(&self) -> Option<&str> {
        self.en
            .as_deref()
            .or(self.ar.as_deref())
            .or(self.ur.as_deref())
    }
}

/// Reference from a book to one of its chapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    /// Store-assigned chapter id.
    pub id: i64,
    /// Sequence number within the book.
    pub number: i64,
}

/// Downloaded book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Unique slug.
    pub slug: String,
    /// Display name.
    pub name: Localized,
    /// Author name.
    pub author: Option<String>,
    /// Number of chapters reported by the API.
    pub chapters_count: i64,
    /// Number of hadiths reported by the API.
    pub hadiths_count: i64,
    /// Chapters owned by this book.
    pub chapters: Vec<ChapterRef>,
    /// Whether the book was saved by a download.
    pub is_downloaded: bool,
    /// Timestamp of the last completed save by a download.
    pub download_date: Option<i64>,
    /// Last write timestamp.
    pub last_updated: Option<i64>,
    /// Revision marker reported by the remote API.
    pub remote_revision: Option<String>,
}

/// Chapter of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Store-assigned id (0 before the chapter is saved).
    pub id: i64,
    /// Owning book.
    pub book_slug: String,
    /// Sequence number within the book.
    pub number: i64,
    /// Chapter title.
    pub title: Localized,
}

/// Single hadith.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hadith {
    /// Remote id.
    pub id: i64,
    /// Owning book.
    pub book_slug: String,
    /// Store-assigned id of the owning chapter.
    pub chapter_id: i64,
    /// Sequence number of the chapter the hadith was fetched from.
    pub chapter_number: Option<i64>,
    /// Number within the book (may carry a suffix such as "12a").
    pub number: String,
    /// Narrator line.
    pub narrator: Localized,
    /// Hadith text.
    pub text: Localized,
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Registered, not yet started.
    Pending,
    /// Currently held by the orchestrator.
    Downloading,
    /// Finished; the row is removed right after.
    Completed,
    /// Failed; kept for retry.
    Failed,
    /// Cancelled by the user; terminal.
    Cancelled,
}

impl QueueStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Downloading => "downloading",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "downloading" => Ok(QueueStatus::Downloading),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Requested explicitly by the reader.
    High,
    /// Background or batch request.
    #[default]
    Normal,
}

impl Priority {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_column!(QueueStatus);
text_column!(Priority);

/// Tracked download request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Auto-assigned id.
    pub id: i64,
    /// Target book.
    pub book_slug: String,
    /// Request priority.
    pub priority: Priority,
    /// Lifecycle status.
    pub status: QueueStatus,
    /// Number of failed attempts.
    pub attempts: i64,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Registration timestamp.
    pub created_at: i64,
    /// Last status change timestamp.
    pub updated_at: i64,
}

/// Row counts per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounts {
    /// Stored books.
    pub books: u64,
    /// Stored chapters.
    pub chapters: u64,
    /// Stored hadiths.
    pub hadiths: u64,
    /// Queue entries.
    pub queue: u64,
}

/// Approximate storage footprint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Sum of the serialized size of every row, in bytes.
    pub total_size: u64,
    /// Row counts.
    pub counts: CollectionCounts,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
