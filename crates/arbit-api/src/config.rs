//! Server configuration loaded from the environment.
//!
//! Feature flags follow one rule: a flag is enabled unless its value is the
//! literal `"false"`, so an unset flag means "on". Validation runs before
//! any listener binds; a misconfigured process exits non-zero.

use std::time::Duration;

use arbit_core::error::{Error, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_QUEUE_SIZE: usize = 200;
const DEFAULT_WORKER_COUNT: usize = 32;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RATE_LIMIT: i64 = 30;
const DEFAULT_RATE_WINDOW_SECS: u64 = 60;
const DEFAULT_OS_URL: &str = "https://localhost:9200";

/// Search index connection settings.
#[derive(Clone, Default)]
pub struct SearchSettings {
    /// Base URL of the search index.
    pub url: String,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password; required when search is enabled.
    pub password: Option<String>,
    /// Skip TLS verification (dev only).
    pub insecure: bool,
}

impl std::fmt::Debug for SearchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Provider credentials.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    /// OpenRouter API key; required when inference is enabled.
    pub api_key: Option<String>,
    /// Override for the OpenRouter base URL.
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Rate limiter settings for the infer endpoint.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Requests allowed per window per identity.
    pub limit: i64,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RATE_LIMIT,
            window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
        }
    }
}

/// Configuration for the arbit API server.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Serve the infer endpoint.
    pub enable_infer: bool,
    /// Connect to the primary store (voting, community, outbox).
    pub enable_db: bool,
    /// Connect to the counter store and rate limit the infer endpoint.
    pub enable_redis: bool,
    /// Run the background outbox publisher.
    pub enable_outbox_publisher: bool,
    /// Serve the search endpoint.
    pub enable_search: bool,

    /// Primary store URL; required when the store is enabled.
    pub database_url: Option<String>,
    /// Counter store URL; required when Redis is enabled.
    pub redis_url: Option<String>,
    /// Queue brokers; required when the publisher is enabled.
    pub kafka_brokers: Vec<String>,
    /// Search index connection settings.
    pub search: SearchSettings,
    /// Provider credentials.
    pub provider: ProviderSettings,

    /// Dispatcher queue capacity.
    pub queue_size: usize,
    /// Dispatcher worker count.
    pub worker_count: usize,
    /// Per-request deadline on the infer endpoint.
    pub request_timeout: Duration,
    /// Infer endpoint rate limiting.
    pub rate_limit: RateLimitSettings,
    /// Publisher batch size override.
    pub publisher_batch_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            enable_infer: true,
            enable_db: true,
            enable_redis: true,
            enable_outbox_publisher: true,
            enable_search: true,
            database_url: None,
            redis_url: None,
            kafka_brokers: Vec::new(),
            search: SearchSettings {
                url: DEFAULT_OS_URL.to_string(),
                ..SearchSettings::default()
            },
            provider: ProviderSettings::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit: RateLimitSettings::default(),
            publisher_batch_size: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a value cannot be parsed or a
    /// required setting is missing for an enabled feature.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.enable_infer = flag_enabled(env_string("ENABLE_INFER").as_deref());
        config.enable_db = flag_enabled(env_string("ENABLE_DB").as_deref());
        config.enable_redis = flag_enabled(env_string("ENABLE_REDIS").as_deref());
        config.enable_outbox_publisher =
            flag_enabled(env_string("ENABLE_OUTBOX_PUBLISHER").as_deref());
        config.enable_search = flag_enabled(env_string("ENABLE_SEARCH").as_deref());

        if let Some(port) = env_u16("PORT")? {
            config.port = port;
        }

        config.database_url = match arbit_core::db::resolve_database_url() {
            Ok(url) => Some(url),
            // A missing URL only matters when the store is enabled.
            Err(error) => {
                if config.enable_db {
                    return Err(error);
                }
                None
            }
        };

        config.redis_url = env_string("REDIS_URL");
        config.kafka_brokers = env_string("KAFKA_BROKERS")
            .map(|csv| parse_brokers(&csv))
            .unwrap_or_default();

        config.search = SearchSettings {
            url: env_string("OS_URL").unwrap_or_else(|| DEFAULT_OS_URL.to_string()),
            username: env_string("OS_USERNAME"),
            password: env_string("OS_PASSWORD"),
            insecure: env_string("OS_INSECURE")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        };

        config.provider = ProviderSettings {
            api_key: env_string("OPENROUTER_API_KEY"),
            base_url: env_string("OPENROUTER_BASE_URL"),
        };

        if let Some(size) = env_usize("QUEUE_SIZE")? {
            config.queue_size = size;
        }
        if let Some(count) = env_usize("WORKER_COUNT")? {
            config.worker_count = count;
        }
        if let Some(secs) = env_u64("REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = env_i64("RATE_LIMIT")? {
            config.rate_limit.limit = limit;
        }
        if let Some(secs) = env_u64("RATE_WINDOW_SECS")? {
            config.rate_limit.window = Duration::from_secs(secs);
        }
        config.publisher_batch_size = env_usize("BATCH_SIZE")?;

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the missing setting.
    pub fn validate(&self) -> Result<()> {
        if self.enable_db && self.database_url.is_none() {
            return Err(Error::InvalidInput(
                "DATABASE_URL is required when ENABLE_DB is true".to_string(),
            ));
        }
        if self.enable_redis && self.redis_url.as_deref().is_none_or(str::is_empty) {
            return Err(Error::InvalidInput(
                "REDIS_URL is required when ENABLE_REDIS is true".to_string(),
            ));
        }
        if self.enable_outbox_publisher {
            if self.kafka_brokers.is_empty() {
                return Err(Error::InvalidInput(
                    "KAFKA_BROKERS is required when ENABLE_OUTBOX_PUBLISHER is true".to_string(),
                ));
            }
            if !self.enable_db {
                return Err(Error::InvalidInput(
                    "ENABLE_OUTBOX_PUBLISHER requires ENABLE_DB".to_string(),
                ));
            }
        }
        if self.enable_search
            && self.search.password.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::InvalidInput(
                "OS_PASSWORD is required when ENABLE_SEARCH is true".to_string(),
            ));
        }
        if self.enable_infer
            && self.provider.api_key.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::InvalidInput(
                "OPENROUTER_API_KEY is required when ENABLE_INFER is true".to_string(),
            ));
        }
        if self.rate_limit.limit <= 0 {
            return Err(Error::InvalidInput(
                "RATE_LIMIT must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::InvalidInput(
                "RATE_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A feature flag is enabled unless its value is the literal `"false"`.
fn flag_enabled(value: Option<&str>) -> bool {
    value != Some("false")
}

fn parse_brokers(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
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

fn env_u16(name: &str) -> Result<Option<u16>> {
    env_parsed(name)
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    env_parsed(name)
}

fn env_i64(name: &str) -> Result<Option<i64>> {
    env_parsed(name)
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    env_parsed(name)
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(value) = env_string(name) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_disabled() -> Config {
        Config {
            enable_infer: false,
            enable_db: false,
            enable_redis: false,
            enable_outbox_publisher: false,
            enable_search: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_flag_enabled_unless_literal_false() {
        assert!(flag_enabled(None));
        assert!(flag_enabled(Some("true")));
        assert!(flag_enabled(Some("1")));
        assert!(flag_enabled(Some("FALSE")));
        assert!(!flag_enabled(Some("false")));
    }

    #[test]
    fn test_broker_csv_parsing() {
        assert_eq!(
            parse_brokers("a:9092, b:9092 ,,c:9092"),
            vec!["a:9092", "b:9092", "c:9092"]
        );
        assert!(parse_brokers("").is_empty());
    }

    #[test]
    fn test_everything_disabled_validates() {
        minimal_disabled().validate().expect("valid");
    }

    #[test]
    fn test_db_requires_url() {
        let config = Config {
            enable_db: true,
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_redis_requires_url() {
        let config = Config {
            enable_redis: true,
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("REDIS_URL"));
    }

    #[test]
    fn test_publisher_requires_brokers_and_db() {
        let config = Config {
            enable_outbox_publisher: true,
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("KAFKA_BROKERS"));

        let config = Config {
            enable_outbox_publisher: true,
            kafka_brokers: vec!["localhost:9092".to_string()],
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("ENABLE_DB"));
    }

    #[test]
    fn test_search_requires_password() {
        let config = Config {
            enable_search: true,
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("OS_PASSWORD"));
    }

    #[test]
    fn test_infer_requires_api_key() {
        let config = Config {
            enable_infer: true,
            ..minimal_disabled()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("OPENROUTER_API_KEY"));
    }
}
