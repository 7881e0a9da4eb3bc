//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use chatwave_shared::constants::{DEFAULT_SUBSCRIBER_HARD_LIMIT, DEFAULT_SUBSCRIBER_SOFT_LIMIT};

const DEFAULT_AVAILABLE_FILES: [&str; 6] = [
    "Financial_Report_Q2.pdf",
    "Project_Plan.docx",
    "Design_Guidelines.pdf",
    "User_Research_Summary.pptx",
    "Meeting_Notes.docx",
    "Budget_Spreadsheet.xlsx",
];

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `chatwave.db` in the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Queued deltas beyond which updates to one entity are coalesced.
    /// Env: `SUBSCRIBER_SOFT_LIMIT`
    /// Default: `256`
    pub subscriber_soft_limit: usize,

    /// Queued deltas at which a subscription is closed as lagging.
    /// Env: `SUBSCRIBER_HARD_LIMIT`
    /// Default: `4096`
    pub subscriber_hard_limit: usize,

    /// Sustained requests per second per client.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst size per client.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,

    /// OpenAI-compatible chat-completions URL for file suggestions.
    /// Env: `SUGGEST_ENDPOINT`
    /// Default: unset (suggestions disabled).
    pub suggest_endpoint: Option<String>,

    /// Env: `SUGGEST_API_KEY`
    pub suggest_api_key: Option<String>,

    /// Env: `SUGGEST_MODEL`
    /// Default: `gpt-4o-mini`
    pub suggest_model: String,

    /// File catalogue offered when a suggestion request names none.
    /// Env: `AVAILABLE_FILES` (comma-separated)
    pub available_files: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            subscriber_soft_limit: DEFAULT_SUBSCRIBER_SOFT_LIMIT,
            subscriber_hard_limit: DEFAULT_SUBSCRIBER_HARD_LIMIT,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            suggest_endpoint: None,
            suggest_api_key: None,
            suggest_model: "gpt-4o-mini".to_string(),
            available_files: DEFAULT_AVAILABLE_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        parse_into(&lookup, "SUBSCRIBER_SOFT_LIMIT", &mut config.subscriber_soft_limit);
        parse_into(&lookup, "SUBSCRIBER_HARD_LIMIT", &mut config.subscriber_hard_limit);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        if config.subscriber_soft_limit > config.subscriber_hard_limit {
            tracing::warn!(
                soft = config.subscriber_soft_limit,
                hard = config.subscriber_hard_limit,
                "SUBSCRIBER_SOFT_LIMIT above hard limit, clamping"
            );
            config.subscriber_soft_limit = config.subscriber_hard_limit;
        }

        if let Some(path) = non_empty(&lookup, "DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        config.suggest_endpoint = non_empty(&lookup, "SUGGEST_ENDPOINT");
        config.suggest_api_key = non_empty(&lookup, "SUGGEST_API_KEY");
        if let Some(model) = non_empty(&lookup, "SUGGEST_MODEL") {
            config.suggest_model = model;
        }

        if let Some(files) = non_empty(&lookup, "AVAILABLE_FILES") {
            config.available_files = files
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}
