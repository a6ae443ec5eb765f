// crates/spatial-engine/src/config.rs

use crate::fallback::FallbackConfig;
use crate::index_optimizer::IndexOptimizerConfig;
use crate::optimizer::{CacheConfig, OptimizerConfig, PrefetchConfig, StreamConfig};
use crate::retry::RetryPolicy;
use crate::store::StoreTimeouts;
use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub primary_path: PathBuf,
    pub secondary_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub request_timeout_seconds: u64,
    pub timeouts: StoreTimeouts,
    pub fallback: FallbackConfig,
    pub index: IndexOptimizerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            raw.parse::<T>().with_context(|| format!("{} has an invalid value: {:?}", key, raw))
        }
        let num = |key: &str, default: &str| -> Result<u64> { parse(key, var(key, default)) };

        let timeouts = StoreTimeouts {
            read: Duration::from_secs(num("READ_TIMEOUT_SECONDS", "10")?),
            bulk: Duration::from_secs(num("BULK_TIMEOUT_SECONDS", "30")?),
            probe: Duration::from_secs(num("PROBE_TIMEOUT_SECONDS", "5")?),
        };

        let retry = RetryPolicy {
            base_delay: Duration::from_millis(num("RETRY_BASE_DELAY_MS", "100")?),
            multiplier: parse("RETRY_MULTIPLIER", var("RETRY_MULTIPLIER", "2.0"))?,
            max_delay: Duration::from_millis(num("RETRY_MAX_DELAY_MS", "5000")?),
            max_attempts: parse("RETRY_MAX_ATTEMPTS", var("RETRY_MAX_ATTEMPTS", "3"))?,
        };

        let optimizer = OptimizerConfig {
            cache: CacheConfig {
                ttl: Duration::from_secs(num("CACHE_TTL_SECONDS", "300")?),
                capacity: num("CACHE_CAPACITY_MB", "100")? * 1024 * 1024,
                ..CacheConfig::default()
            },
            prefetch: PrefetchConfig {
                enabled: parse("PREFETCH_ENABLED", var("PREFETCH_ENABLED", "true"))?,
                co_occurrence_window: Duration::from_millis(num("PREFETCH_WINDOW_MS", "2000")?),
                ..PrefetchConfig::default()
            },
            stream: StreamConfig {
                queue_capacity: parse("STREAM_QUEUE_CAPACITY", var("STREAM_QUEUE_CAPACITY", "100"))?,
                heartbeat: Duration::from_secs(num("STREAM_HEARTBEAT_SECONDS", "60")?),
            },
            bulk_batch_size: parse("BULK_BATCH_SIZE", var("BULK_BATCH_SIZE", "1000"))?,
        };

        let fallback = FallbackConfig {
            health_interval: Duration::from_secs(num("HEALTH_INTERVAL_SECONDS", "30")?),
            probe_deadline: timeouts.probe,
            retry,
            optimizer,
        };

        let index = IndexOptimizerConfig {
            slow_query_threshold: Duration::from_millis(num("SLOW_QUERY_MS", "100")?),
            reindex_size_threshold: num("REINDEX_THRESHOLD_MB", "10")? * 1024 * 1024,
            statistics_interval: Duration::from_secs(num("STATISTICS_INTERVAL_SECONDS", "3600")?),
            reindex_interval: Duration::from_secs(num("REINDEX_INTERVAL_SECONDS", "86400")?),
        };

        let config = Self {
            primary_path: PathBuf::from(var("PRIMARY_DB_PATH", "data/primary.db")),
            secondary_path: PathBuf::from(var("SECONDARY_DB_PATH", "data/secondary.db")),
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: parse("API_PORT", var("API_PORT", "8080"))?,
            request_timeout_seconds: num("REQUEST_TIMEOUT_SECONDS", "30")?,
            timeouts,
            fallback,
            index,
        };

        info!(
            "Store configuration: primary {}, secondary {}, health every {:?}, cache ttl {:?}",
            config.primary_path.display(),
            config.secondary_path.display(),
            config.fallback.health_interval,
            config.fallback.optimizer.cache.ttl
        );
        Ok(config)
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}
