//! Bridge server entry point.

use mimalloc::MiMalloc;

/// Global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use dotenvy::dotenv;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use agent_bridge::config::{AppConfig, load_llm_settings};
use agent_bridge::server::start_server;

#[tokio::main]
async fn main() {
    // Structured logging, RUST_LOG-overridable
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // Load .env (if present)
    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let settings = match load_llm_settings(&config.completion) {
        Ok(s) => s,
        Err(msg) => {
            eprintln!("Configuration error: {msg}");
            std::process::exit(1);
        }
    };

    if let Err(e) = start_server(config, settings).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
