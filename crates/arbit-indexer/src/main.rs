//! `arbit-indexer` binary entrypoint.
//!
//! Long-running consumer: reads envelopes from the queue, rebuilds pair
//! documents from the primary store and upserts them into the search
//! index. Handler failures are logged and the loop continues; redelivery
//! plus the idempotent rebuild make that safe, and a repair job is assumed
//! to reconcile any drift.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod processor;

use anyhow::{Context, Result};
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};

use arbit_core::db;
use arbit_core::observability::{LogFormat, init_logging};
use arbit_core::search::{PAIRS_INDEX, SearchClient, SearchClientConfig, ensure_pairs_index};

struct IndexerConfig {
    database_url: String,
    brokers: String,
    group_id: String,
    topic: String,
    search: SearchClientConfig,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn load_config() -> Result<IndexerConfig> {
    let database_url = db::resolve_database_url()?;

    let password = env_string("OS_PASSWORD")
        .context("OS_PASSWORD is required")?;

    Ok(IndexerConfig {
        database_url,
        brokers: env_string("KAFKA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
        group_id: env_string("KAFKA_GROUP_ID").unwrap_or_else(|| "search-indexer".to_string()),
        topic: env_string("KAFKA_TOPIC").unwrap_or_else(|| "search-index".to_string()),
        search: SearchClientConfig {
            url: env_string("OS_URL").unwrap_or_else(|| "http://localhost:9200".to_string()),
            username: env_string("OS_USERNAME"),
            password: Some(password),
            insecure: env_string("OS_INSECURE").is_some_and(|v| v.eq_ignore_ascii_case("true")),
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(if cfg!(debug_assertions) {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    let config = load_config()?;

    let pool = db::connect_pool(&config.database_url).await?;

    let client = SearchClient::new(config.search.clone())?;
    // Missing index with a failed create is a startup failure, not
    // something to retry per message.
    ensure_pairs_index(&client, PAIRS_INDEX).await?;

    let consumer: StreamConsumer = rdkafka::ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .create()
        .context("create kafka consumer")?;
    consumer
        .subscribe(&[config.topic.as_str()])
        .context("subscribe")?;

    tracing::info!(
        topic = %config.topic,
        group = %config.group_id,
        brokers = %config.brokers,
        search = %config.search.url,
        "indexer up"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            message = consumer.recv() => {
                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(error = %error, "read message error");
                        continue;
                    }
                };

                let Some(payload) = message.payload() else {
                    continue;
                };

                if let Err(error) =
                    processor::handle_message(&pool, &client, PAIRS_INDEX, payload).await
                {
                    // At-least-once: the rebuild is idempotent, so logging
                    // and moving on is safe here.
                    let key = message
                        .key()
                        .map(String::from_utf8_lossy)
                        .unwrap_or_default();
                    tracing::warn!(key = %key, error = %error, "handle error");
                }
            }
        }
    }

    Ok(())
}
