use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Offline cache for hadith collections.
#[derive(Parser, Debug, Clone)]
#[command(name = "hadith-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "HADITH_CACHE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// API key for the content API (overrides the config file).
    #[arg(long, env = "HADITH_API_KEY", global = true, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the local API server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Download one or more books, one after the other.
    Download {
        /// Book slugs.
        #[arg(required = true)]
        slugs: Vec<String>,
        /// Queue with high priority.
        #[arg(long)]
        high: bool,
    },

    /// Retry failed downloads that are below the attempt ceiling.
    Retry,

    /// Re-download books whose remote revision changed.
    Update,

    /// Repair hadith to chapter links of stored books.
    Repair,

    /// List downloaded books.
    List,

    /// Delete a book with its chapters and hadiths.
    Delete {
        /// Book slug.
        slug: String,
    },

    /// Show the download queue.
    Queue,

    /// Show storage usage.
    Info,

    /// Remove every stored book, chapter, hadith and queue entry.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Content API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Download configuration.
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        8090,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/hadith-cache.db")
}

/// Content API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the content API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent as the `apiKey` query parameter.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Page size for hadith listings; large enough to fetch a chapter in one call.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Request timeout in seconds (unset: no timeout).
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            page_size: default_page_size(),
            timeout_seconds: None,
        }
    }
}

fn default_base_url() -> String {
    "https://hadithapi.com/api".to_string()
}

fn default_page_size() -> u32 {
    1000
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Failed downloads are retried until they reach this many attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Run the hadith/chapter repair pass when the server starts.
    #[serde(default = "default_repair_on_start")]
    pub repair_on_start: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            repair_on_start: default_repair_on_start(),
        }
    }
}

fn default_max_attempts() -> i64 {
    3
}

fn default_repair_on_start() -> bool {
    true
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> crate::error::Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })?;

        if config.download.max_attempts < 1 {
            return Err(crate::error::AppError::Config(
                "download.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("hadith-cache.toml"),
            dirs::config_dir()
                .map(|p| p.join("hadith-cache").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/hadith-cache/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# hadith-cache configuration

[server]
bind = "127.0.0.1:8090"

[database]
# path = "/var/lib/hadith-cache/hadith-cache.db"

[api]
base_url = "https://hadithapi.com/api"
# api_key = "..."   (or set HADITH_API_KEY)
# Hadiths requested per page; large enough to get a chapter in one call
page_size = 1000
# Request timeout in seconds (no timeout when unset)
# timeout_seconds = 60

[download]
# Failed downloads are retried until they reach this many attempts
max_attempts = 3
# Repair hadith/chapter links when the server starts
repair_on_start = true
"#
        .to_string()
    }
}
