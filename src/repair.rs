//! Repair of hadith to chapter links.
//!
//! Older versions stored the remote chapter number in `chapter_id` instead of
//! the store-assigned chapter id, so hadiths did not join to their chapter.
//! This pass recomputes the link of every hadith of every downloaded book and
//! rewrites only the rows that differ, so running it again changes nothing.

use crate::db::{Chapter, Database, Hadith};
use crate::error::Result;
use serde::Serialize;
use std::collections::HashMap;

/// Outcome of a repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Downloaded books examined.
    pub books: usize,
    /// Hadiths examined.
    pub hadiths_checked: usize,
    /// Hadiths rewritten.
    pub hadiths_rewritten: usize,
}

/// Chapter lookups for one book.
struct ChapterIndex<'a> {
    id_by_number: HashMap<i64, i64>,
    first: &'a Chapter,
}

impl<'a> ChapterIndex<'a> {
    fn new(chapters: &'a [Chapter]) -> Option<Self> {
        let first = chapters.first()?;
        Some(Self {
            id_by_number: chapters.iter().map(|c| (c.number, c.id)).collect(),
            first,
        })
    }

    /// Chapter id and number a hadith should carry.
    ///
    /// Hadiths written by the downloader record the number of the chapter they
    /// came from. Rows without it predate that column, and their `chapter_id`
    /// holds the remote chapter number.
    fn expected(&self, hadith: &Hadith) -> (i64, Option<i64>) {
        match hadith.chapter_number {
            Some(number) => match self.id_by_number.get(&number) {
                Some(&id) => (id, Some(number)),
                None => (self.first.id, Some(number)),
            },
            None => match self.id_by_number.get(&hadith.chapter_id) {
                Some(&id) => (id, Some(hadith.chapter_id)),
                None => (self.first.id, Some(self.first.number)),
            },
        }
    }
}

/// Repair hadith to chapter links of every downloaded book.
pub fn repair_hadith_chapters(db: &Database) -> Result<RepairReport> {
    let mut report = RepairReport::default();

    for book in db.get_all_books()?.into_iter().filter(|b| b.is_downloaded) {
        report.books += 1;

        let chapters = db.get_chapters(&book.slug)?;
        let Some(index) = ChapterIndex::new(&chapters) else {
            tracing::debug!(slug = %book.slug, "No chapters stored, skipping repair");
            continue;
        };

        let mut rewritten = 0;
        for hadith in db.get_hadiths(&book.slug, None)? {
            report.hadiths_checked += 1;

            let (chapter_id, chapter_number) = index.expected(&hadith);
            if hadith.chapter_id == chapter_id && hadith.chapter_number == chapter_number {
                continue;
            }

            db.update_hadith_chapter(&book.slug, hadith.id, chapter_id, chapter_number)?;
            rewritten += 1;
        }

        if rewritten > 0 {
            tracing::info!(slug = %book.slug, rewritten, "Repaired hadith chapter links");
        }
        report.hadiths_rewritten += rewritten;
    }

    Ok(report)
}
