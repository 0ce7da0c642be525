//! hadith-cache: offline cache of hadith collections.
//!
//! Books are pulled from a remote hadith API (metadata, chapters, then every
//! chapter's hadiths) and kept in a local SQLite store so they can be read
//! without a network connection.
//!
//! # Features
//!
//! - One download at a time, with progress reporting and cancellation
//! - Download queue with failure tracking and bounded retries
//! - Update check against the remote revision of downloaded books
//! - Repair of hadith to chapter links written by older versions
//! - Local JSON API over the stored content

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration and CLI.
pub mod config;
/// Persistent store.
pub mod db;
/// Download orchestration.
pub mod download;
/// Error types.
pub mod error;
/// Remote content API client.
pub mod fetcher;
/// Hadith to chapter link repair.
pub mod repair;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use download::Downloader;
pub use error::{AppError, Result};
pub use server::AppState;
