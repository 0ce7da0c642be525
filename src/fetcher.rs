//! Remote content API client.
//!
//! Plain reads with no caching and no retry: every call hits the network and
//! every failure goes straight back to the caller.

use crate::config::ApiConfig;
use crate::db::{Book, Chapter, Hadith, Localized};
use crate::error::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Read access to book content.
pub trait ContentSource: Send + Sync {
    /// Metadata of one book. The returned book has no chapters attached.
    fn fetch_book(&self, slug: &str) -> impl Future<Output = Result<Book>> + Send;

    /// Chapter list of a book, in API order. Ids are left at 0.
    fn fetch_chapters(&self, slug: &str) -> impl Future<Output = Result<Vec<Chapter>>> + Send;

    /// Every hadith of one chapter. `chapter_id` is left at 0 and
    /// `chapter_number` is set to `chapter_number`.
    fn fetch_hadiths(
        &self,
        slug: &str,
        chapter_number: i64,
    ) -> impl Future<Output = Result<Vec<Hadith>>> + Send;
}

/// HTTP client for a hadithapi-style content API.
#[derive(Clone)]
pub struct HttpContentSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
}

impl HttpContentSource {
    /// Build a client from configuration.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("hadith-cache/", env!("CARGO_PKG_VERSION")));
        if let Some(secs) = config.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size.max(1),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.query(&[("apiKey", key)]);
        }

        tracing::debug!(url = %url, "Fetching");
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Network(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::NotFound(format!("{} returned {}", url, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::Network(format!("GET {}: {}", url, e)))?;

        serde_json::from_str(&body)
            .map_err(|e| AppError::NotFound(format!("Unexpected response from {}: {}", url, e)))
    }
}

impl ContentSource for HttpContentSource {
    async fn fetch_book(&self, slug: &str) -> Result<Book> {
        let response: BooksResponse = self.get_json("books", &[]).await?;
        check_status(response.status, "books")?;

        response
            .books
            .into_iter()
            .find(|b| b.slug == slug)
            .map(RemoteBook::into_book)
            .ok_or_else(|| AppError::NotFound(format!("book '{}'", slug)))
    }

    async fn fetch_chapters(&self, slug: &str) -> Result<Vec<Chapter>> {
        let path = format!("{}/chapters", urlencoding::encode(slug));
        let response: ChaptersResponse = self.get_json(&path, &[]).await?;
        check_status(response.status, &path)?;

        Ok(response
            .chapters
            .into_iter()
            .map(|c| c.into_chapter(slug))
            .collect())
    }

    async fn fetch_hadiths(&self, slug: &str, chapter_number: i64) -> Result<Vec<Hadith>> {
        let mut hadiths = Vec::new();
        let mut page = 1;

        loop {
            let response: HadithsResponse = self
                .get_json(
                    "hadiths",
                    &[
                        ("book", slug.to_string()),
                        ("chapter", chapter_number.to_string()),
                        ("paginate", self.page_size.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;
            check_status(response.status, "hadiths")?;

            let listing = response
                .hadiths
                .ok_or_else(|| AppError::NotFound(format!("hadiths of {}/{}", slug, chapter_number)))?;

            hadiths.extend(
                listing
                    .data
                    .into_iter()
                    .map(|h| h.into_hadith(slug, chapter_number)),
            );

            if page >= listing.last_page {
                break;
            }
            page += 1;
        }

        tracing::debug!(slug, chapter = chapter_number, count = hadiths.len(), "Fetched hadiths");
        Ok(hadiths)
    }
}

fn check_status(status: i64, what: &str) -> Result<()> {
    if status == 200 {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("{} (status {})", what, status)))
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Flex {
    Int(i64),
    Text(String),
}

/// The API sends counts and numbers either as JSON numbers or as strings.
fn flex_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    match Flex::deserialize(d)? {
        Flex::Int(n) => Ok(n),
        Flex::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flex_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Flex::deserialize(d)? {
        Flex::Int(n) => n.to_string(),
        Flex::Text(s) => s,
    })
}

#[derive(Deserialize)]
struct BooksResponse {
    #[serde(deserialize_with = "flex_i64")]
    status: i64,
    #[serde(default)]
    books: Vec<RemoteBook>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteBook {
    #[serde(rename = "bookSlug")]
    slug: String,
    book_name: Option<String>,
    book_name_arabic: Option<String>,
    book_name_urdu: Option<String>,
    writer_name: Option<String>,
    #[serde(rename = "chapters_count", default, deserialize_with = "flex_i64")]
    chapters_count: i64,
    #[serde(rename = "hadiths_count", default, deserialize_with = "flex_i64")]
    hadiths_count: i64,
    #[serde(alias = "updated_at")]
    last_updated: Option<String>,
}

impl RemoteBook {
    fn into_book(self) -> Book {
        Book {
            slug: self.slug,
            name: Localized {
                en: self.book_name,
                ar: self.book_name_arabic,
                ur: self.book_name_urdu,
            },
            author: self.writer_name,
            chapters_count: self.chapters_count,
            hadiths_count: self.hadiths_count,
            chapters: Vec::new(),
            is_downloaded: false,
            download_date: None,
            last_updated: None,
            remote_revision: self.last_updated,
        }
    }
}

#[derive(Deserialize)]
struct ChaptersResponse {
    #[serde(deserialize_with = "flex_i64")]
    status: i64,
    #[serde(default)]
    chapters: Vec<RemoteChapter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteChapter {
    #[serde(deserialize_with = "flex_i64")]
    chapter_number: i64,
    chapter_english: Option<String>,
    chapter_arabic: Option<String>,
    chapter_urdu: Option<String>,
}

impl RemoteChapter {
    fn into_chapter(self, slug: &str) -> Chapter {
        Chapter {
            id: 0,
            book_slug: slug.to_string(),
            number: self.chapter_number,
            title: Localized {
                en: self.chapter_english,
                ar: self.chapter_arabic,
                ur: self.chapter_urdu,
            },
        }
    }
}

#[derive(Deserialize)]
struct HadithsResponse {
    #[serde(deserialize_with = "flex_i64")]
    status: i64,
    hadiths: Option<HadithListing>,
}

#[derive(Deserialize)]
struct HadithListing {
    #[serde(default = "first_page", deserialize_with = "flex_i64")]
    last_page: i64,
    #[serde(default)]
    data: Vec<RemoteHadith>,
}

fn first_page() -> i64 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteHadith {
    id: i64,
    #[serde(deserialize_with = "flex_string")]
    hadith_number: String,
    english_narrator: Option<String>,
    urdu_narrator: Option<String>,
    hadith_english: Option<String>,
    hadith_arabic: Option<String>,
    hadith_urdu: Option<String>,
}

impl RemoteHadith {
    fn into_hadith(self, slug: &str, chapter_number: i64) -> Hadith {
        Hadith {
            id: self.id,
            book_slug: slug.to_string(),
            chapter_id: 0,
            chapter_number: Some(chapter_number),
            number: self.hadith_number,
            narrator: Localized {
                en: self.english_narrator,
                ar: None,
                ur: self.urdu_narrator,
            },
            text: Localized {
                en: self.hadith_english,
                ar: self.hadith_arabic,
                ur: self.hadith_urdu,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn books() -> Json<Value> {
        Json(json!({
            "status": 200,
            "message": "Books has been found.",
            "books": [{
                "id": 1,
                "bookName": "Sahih Bukhari",
                "writerName": "Imam Bukhari",
                "bookSlug": "sahih-bukhari",
                "hadiths_count": "7276",
                "chapters_count": "99",
                "updated_at": "2024-01-01"
            }]
        }))
    }

    async fn chapters(Path(slug): Path<String>) -> impl IntoResponse {
        if slug != "sahih-bukhari" {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": 404, "message": "Chapters not found." })),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "status": 200,
                "chapters": [
                    { "id": 10, "chapterNumber": "1", "chapterEnglish": "Revelation", "bookSlug": slug },
                    { "id": 11, "chapterNumber": 2, "chapterEnglish": "Belief", "bookSlug": slug }
                ]
            })),
        )
    }

    async fn hadiths(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
        let page: i64 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        if query.get("chapter").map(String::as_str) == Some("9") {
            return Json(json!({ "status": 404, "message": "Hadiths not found." }));
        }
        if query.get("apiKey").map(String::as_str) != Some("secret") {
            return Json(json!({ "status": 401 }));
        }
        Json(json!({
            "status": 200,
            "hadiths": {
                "current_page": page,
                "last_page": 2,
                "data": [{
                    "id": 100 + page,
                    "hadithNumber": page,
                    "englishNarrator": "Narrated Umar",
                    "hadithEnglish": format!("text {}", page),
                    "chapterId": "1"
                }]
            }
        }))
    }

    async fn stub_server() -> String {
        let app = Router::new()
            .route("/books", get(books))
            .route("/{slug}/chapters", get(chapters))
            .route("/hadiths", get(hadiths));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn source(base_url: String) -> HttpContentSource {
        HttpContentSource::new(&ApiConfig {
            base_url,
            api_key: Some("secret".to_string()),
            page_size: 500,
            timeout_seconds: Some(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_book_by_slug() {
        let source = source(stub_server().await);

        let book = source.fetch_book("sahih-bukhari").await.unwrap();
        assert_eq!(book.name.en.as_deref(), Some("Sahih Bukhari"));
        assert_eq!(book.author.as_deref(), Some("Imam Bukhari"));
        assert_eq!(book.hadiths_count, 7276);
        assert_eq!(book.chapters_count, 99);
        assert_eq!(book.remote_revision.as_deref(), Some("2024-01-01"));
        assert!(book.chapters.is_empty());

        let missing = source.fetch_book("unknown").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_chapters_accepts_string_numbers() {
        let source = source(stub_server().await);

        let chapters = source.fetch_chapters("sahih-bukhari").await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].number, 1);
        assert_eq!(chapters[1].number, 2);
        assert_eq!(chapters[1].title.en.as_deref(), Some("Belief"));
        assert!(chapters.iter().all(|c| c.id == 0));

        let missing = source.fetch_chapters("unknown").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_hadiths_follows_pages() {
        let source = source(stub_server().await);

        let hadiths = source.fetch_hadiths("sahih-bukhari", 1).await.unwrap();
        assert_eq!(hadiths.len(), 2);
        assert_eq!(hadiths[0].id, 101);
        assert_eq!(hadiths[1].number, "2");
        assert!(hadiths.iter().all(|h| h.chapter_number == Some(1)));
        assert!(hadiths.iter().all(|h| h.book_slug == "sahih-bukhari"));
    }

    #[tokio::test]
    async fn test_status_discriminator_is_checked() {
        let source = source(stub_server().await);

        let result = source.fetch_hadiths("sahih-bukhari", 9).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = source(format!("http://{}", addr));
        let result = source.fetch_book("sahih-bukhari").await;
        assert!(matches!(result, Err(AppError::Network(_))));
    }
}
