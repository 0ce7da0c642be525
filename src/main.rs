//! hadith-cache entry point.

use clap::Parser;
use hadith_cache::{
    config::{Cli, Command, Config},
    db::{Database, Priority, timestamp_to_datetime},
    download::{BatchOutcome, DownloadObserver, DownloadSummary},
    error::AppError,
    fetcher::HttpContentSource,
    server::{self, AppState, HttpDownloader},
};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Server logs at info, one-shot commands only report problems
    let default_filter = match cli.command {
        None | Some(Command::Serve { .. }) => "hadith_cache=info,tower_http=info",
        Some(_) => "hadith_cache=warn",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let mut config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };
    if let Some(key) = cli.api_key {
        config.api.api_key = Some(key);
    }

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
        Some(Command::Download { slugs, high }) => {
            let priority = if high {
                Priority::High
            } else {
                Priority::Normal
            };
            let downloader = open_downloader(&config)?;
            let outcomes = downloader
                .batch_download(&slugs, priority, &mut ProgressPrinter::default())
                .await;
            print_outcomes(&outcomes)
        }
        Some(Command::Retry) => {
            let downloader = open_downloader(&config)?;
            let outcomes = downloader
                .retry_failed_downloads(&mut ProgressPrinter::default())
                .await?;
            if outcomes.is_empty() {
                println!("Nothing to retry.");
                return Ok(());
            }
            print_outcomes(&outcomes)
        }
        Some(Command::Update) => {
            let downloader = open_downloader(&config)?;
            let report = downloader
                .update_downloaded_books(&mut ProgressPrinter::default())
                .await?;
            println!(
                "Checked {} books, {} updated.",
                report.checked,
                report.updated.len()
            );
            for slug in &report.updated {
                println!("  updated: {}", slug);
            }
            print_outcomes(&report.failed)
        }
        Some(Command::Repair) => {
            let db = Database::open(&config.database.path)?;
            let report = hadith_cache::repair::repair_hadith_chapters(&db)?;
            println!(
                "Checked {} hadiths in {} books, rewrote {}.",
                report.hadiths_checked, report.books, report.hadiths_rewritten
            );
            Ok(())
        }
        Some(Command::List) => cmd_list(&config),
        Some(Command::Delete { slug }) => {
            let db = Database::open(&config.database.path)?;
            if db.delete_book(&slug)? {
                println!("Deleted book: {}", slug);
            } else {
                println!("Book not found: {}", slug);
            }
            Ok(())
        }
        Some(Command::Queue) => cmd_queue(&config),
        Some(Command::Info) => cmd_info(&config),
        Some(Command::Clear { yes }) => {
            if !yes {
                let answer = prompt("Delete every stored book and queue entry? [y/N] ")?;
                if !matches!(answer.as_str(), "y" | "Y" | "yes") {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            let db = Database::open(&config.database.path)?;
            db.clear_all_data()?;
            println!("Cleared all stored data.");
            Ok(())
        }
    }
}

/// Initialize config and database.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    let _db = open_database(&config)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nSet api_key in config.toml (or HADITH_API_KEY).");
    println!("Then run: hadith-cache download <slug>");

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    let downloader = open_downloader(&config)?;

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting hadith-cache server"
    );

    if config.download.repair_on_start {
        match downloader.repair() {
            Ok(report) => tracing::info!(
                books = report.books,
                checked = report.hadiths_checked,
                rewritten = report.hadiths_rewritten,
                "Hadith chapter repair finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Hadith chapter repair failed"),
        }
    }

    let bind = config.server.bind;
    let state = AppState::new(downloader);
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// List downloaded books.
fn cmd_list(config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let books = db.get_all_books()?;

    if books.is_empty() {
        println!("No books downloaded.");
        return Ok(());
    }

    println!(
        "{:<24} {:<36} {:>8} {:>8} DOWNLOADED",
        "SLUG", "NAME", "CHAPTERS", "HADITHS"
    );
    println!("{}", "-".repeat(100));
    for book in books {
        let downloaded = book
            .download_date
            .map(|ts| timestamp_to_datetime(ts).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let hadiths = db.get_hadiths(&book.slug, None)?.len();
        println!(
            "{:<24} {:<36} {:>8} {:>8} {}",
            book.slug,
            book.name.best().unwrap_or("-"),
            book.chapters.len(),
            hadiths,
            downloaded
        );
    }

    Ok(())
}

/// Show the download queue.
fn cmd_queue(config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let queue = db.get_download_queue()?;

    if queue.is_empty() {
        println!("Download queue is empty.");
        return Ok(());
    }

    println!(
        "{:<6} {:<24} {:<8} {:<12} {:>8} LAST ERROR",
        "ID", "SLUG", "PRIORITY", "STATUS", "ATTEMPTS"
    );
    println!("{}", "-".repeat(100));
    for entry in queue {
        println!(
            "{:<6} {:<24} {:<8} {:<12} {:>8} {}",
            entry.id,
            entry.book_slug,
            entry.priority.as_str(),
            entry.status,
            entry.attempts,
            entry.last_error.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

/// Show storage usage.
fn cmd_info(config: &Config) -> anyhow::Result<()> {
    let downloader = open_downloader(config)?;
    let info = downloader.get_storage_info()?;

    println!("Database:   {}", config.database.path.display());
    println!("Size:       {}", server::format_size(info.total_size));
    println!(
        "Books:      {} ({} downloaded)",
        info.counts.books, info.downloaded_books_count
    );
    println!("Chapters:   {}", info.counts.chapters);
    println!("Hadiths:    {}", info.counts.hadiths);
    println!("Queue:      {}", info.counts.queue);

    Ok(())
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&config.database.path)?)
}

fn open_downloader(config: &Config) -> anyhow::Result<HttpDownloader> {
    let db = open_database(config)?;
    let source = HttpContentSource::new(&config.api)?;
    Ok(HttpDownloader::new(
        db,
        source,
        config.download.max_attempts,
    ))
}

fn print_outcomes(outcomes: &[BatchOutcome]) -> anyhow::Result<()> {
    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
    for outcome in &failed {
        eprintln!(
            "Failed: {} ({})",
            outcome.slug,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !failed.is_empty() {
        anyhow::bail!("{} of {} downloads failed", failed.len(), outcomes.len());
    }
    Ok(())
}

/// Prints download progress on one terminal line per book.
#[derive(Default)]
struct ProgressPrinter {
    last: Option<u32>,
}

impl DownloadObserver for ProgressPrinter {
    fn on_progress(&mut self, slug: &str, progress: f64) {
        let percent = progress.round() as u32;
        if self.last == Some(percent) {
            return;
        }
        self.last = Some(percent);
        print!("\r{}: {:>3}%", slug, percent);
        let _ = io::stdout().flush();
    }

    fn on_complete(&mut self, summary: &DownloadSummary) {
        self.last = None;
        println!(
            "\r{}: {} hadiths in {} chapters",
            summary.slug, summary.total_hadiths, summary.total_chapters
        );
    }

    fn on_error(&mut self, slug: &str, error: &AppError) {
        if self.last.take().is_some() {
            println!();
        }
        eprintln!("{}: {}", slug, error);
    }
}

/// Read one line from stdin.
fn prompt(message: &str) -> anyhow::Result<String> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;

    Ok(answer.trim().to_string())
}
