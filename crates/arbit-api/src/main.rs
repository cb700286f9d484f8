//! `arbit-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP
//! server; exits non-zero on configuration or startup failure.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use arbit_api::config::Config;
use arbit_api::server::Server;
use arbit_core::observability::{LogFormat, init_logging};

fn log_format() -> LogFormat {
    if cfg!(debug_assertions) {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format());

    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        infer = config.enable_infer,
        db = config.enable_db,
        redis = config.enable_redis,
        publisher = config.enable_outbox_publisher,
        search = config.enable_search,
        "starting arbit api"
    );

    Server::new(config).serve().await
}
