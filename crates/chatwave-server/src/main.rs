//! # chatwave-server
//!
//! HTTP front of the ChatWave messaging core.
//!
//! This binary provides:
//! - **REST API** (axum) for users, chats and messages, with JSON bodies and
//!   the error taxonomy mapped onto status codes
//! - **Server-sent event streams** for the user directory, a user's chat
//!   list and a chat's message log (snapshot, then ordered deltas, with
//!   cursor resume through `Last-Event-ID`)
//! - **File suggestions** through an OpenAI-compatible model endpoint
//! - **Per-client rate limiting** to protect against abuse

mod api;
mod config;
mod error;
mod rate_limit;

use std::sync::Arc;

use chatwave_store::Database;
use chatwave_sync::suggest::{FileSuggester, HttpSuggester, SuggestConfig};
use chatwave_sync::{ChatService, FanoutConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,chatwave_server=debug,chatwave_sync=debug")
            }),
        )
        .init();

    info!("Starting ChatWave server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = ?config.database_path,
        soft_limit = config.subscriber_soft_limit,
        hard_limit = config.subscriber_hard_limit,
        rate_limit = config.rate_limit_per_sec,
        burst = config.rate_limit_burst,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let database = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };

    let service = ChatService::new(
        database,
        FanoutConfig {
            soft_limit: config.subscriber_soft_limit,
            hard_limit: config.subscriber_hard_limit,
        },
    );

    let suggester: Option<Arc<dyn FileSuggester>> = match &config.suggest_endpoint {
        Some(endpoint) => {
            let mut suggest_config = SuggestConfig::new(endpoint.clone(), config.suggest_model.clone());
            suggest_config.api_key = config.suggest_api_key.clone();
            info!(endpoint = %endpoint, model = %config.suggest_model, "File suggestions enabled");
            Some(Arc::new(HttpSuggester::new(suggest_config)?))
        }
        None => {
            info!("SUGGEST_ENDPOINT not set, file suggestions disabled");
            None
        }
    };

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let http_addr = config.http_addr;
    let app_state = AppState {
        service: service.clone(),
        suggester,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Ends every open event stream with a `shutdown` close event.
    service.shutdown();

    Ok(())
}
