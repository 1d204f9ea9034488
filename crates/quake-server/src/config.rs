//! Configuration management
//!
//! Every setting comes from the environment (a `.env` file is honoured) and
//! falls back to the `DEFAULT_*` constants below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/quake";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Broker Configuration Constants
// ============================================================================

pub const DEFAULT_JOB_REQUESTS_QUEUE: &str = "job-requests";
pub const DEFAULT_WORKER_REQUESTS_QUEUE: &str = "worker-requests";
pub const DEFAULT_WORKER_REPLIES_QUEUE: &str = "worker-replies";

/// How long a claimed message stays hidden before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;

/// Claims allowed before a message is moved to its dead-letter queue.
pub const DEFAULT_MAX_DELIVERIES: i32 = 5;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

pub const DEFAULT_INPUT_DIRECTORY: &str = "./data";
pub const DEFAULT_FILE_PREFIX: &str = "earthquakes";
pub const DEFAULT_FILE_SUFFIX: &str = ".csv";

/// Rows per transactional chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Upper bound keeping a multi-row insert under the PostgreSQL bind limit.
pub const MAX_CHUNK_SIZE: usize = 4000;

pub const DEFAULT_WORKER_COUNT: usize = 1;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// A step fails once replies are this late. Zero waits indefinitely, which
/// leaves an execution STARTED for good if its assignment is dead-lettered.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 3600;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub ingest: IngestConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Separate database for ingested rows; job tracking stays on `url`
    pub analytics_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Postgres,
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BrokerBackend::Postgres),
            "memory" | "in-memory" => Ok(BrokerBackend::Memory),
            _ => Err(anyhow::anyhow!("Invalid broker backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub job_requests_queue: String,
    pub worker_requests_queue: String,
    pub worker_replies_queue: String,
    pub visibility_timeout_secs: u64,
    pub max_deliveries: i32,
    pub poll_interval_ms: u64,
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Root under which job data directories are resolved
    pub input_directory: PathBuf,
    pub file_prefix: String,
    pub file_suffix: String,
    pub chunk_size: usize,
    pub worker_count: usize,
    pub max_concurrent_jobs: usize,
    pub reply_timeout_secs: u64,
    /// Overrides the hostname as the reported worker identity
    pub worker_id: Option<String>,
}

impl IngestConfig {
    pub fn reply_timeout(&self) -> Option<Duration> {
        (self.reply_timeout_secs > 0).then(|| Duration::from_secs(self.reply_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build a configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parsed = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match parsed(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
                None => Ok(default),
            }
        };
        let text = |key: &str, default: &str| -> anyhow::Result<String> {
            Ok(parsed(key).unwrap_or_else(|| default.to_string()))
        };

        Ok(Config {
            server: ServerConfig {
                host: text("QUAKE_HOST", DEFAULT_SERVER_HOST)?,
                port: u16::try_from(number("QUAKE_PORT", u64::from(DEFAULT_SERVER_PORT))?)?,
                shutdown_timeout_secs: number("QUAKE_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?,
            },
            database: DatabaseConfig {
                url: text("DATABASE_URL", DEFAULT_DATABASE_URL)?,
                analytics_url: parsed("ANALYTICS_DATABASE_URL"),
                max_connections: u32::try_from(number(
                    "DATABASE_MAX_CONNECTIONS",
                    u64::from(DEFAULT_DATABASE_MAX_CONNECTIONS),
                )?)?,
                min_connections: u32::try_from(number(
                    "DATABASE_MIN_CONNECTIONS",
                    u64::from(DEFAULT_DATABASE_MIN_CONNECTIONS),
                )?)?,
                connect_timeout_secs: number(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: number("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS)?,
            },
            broker: BrokerConfig {
                backend: text("BROKER_BACKEND", "postgres")?.parse()?,
                job_requests_queue: text("BROKER_JOB_REQUESTS_QUEUE", DEFAULT_JOB_REQUESTS_QUEUE)?,
                worker_requests_queue: text(
                    "BROKER_WORKER_REQUESTS_QUEUE",
                    DEFAULT_WORKER_REQUESTS_QUEUE,
                )?,
                worker_replies_queue: text("BROKER_WORKER_REPLIES_QUEUE", DEFAULT_WORKER_REPLIES_QUEUE)?,
                visibility_timeout_secs: number(
                    "BROKER_VISIBILITY_TIMEOUT_SECS",
                    DEFAULT_VISIBILITY_TIMEOUT_SECS,
                )?,
                max_deliveries: i32::try_from(number(
                    "BROKER_MAX_DELIVERIES",
                    DEFAULT_MAX_DELIVERIES as u64,
                )?)?,
                poll_interval_ms: number("BROKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
            },
            ingest: IngestConfig {
                input_directory: PathBuf::from(text("INGEST_INPUT_DIRECTORY", DEFAULT_INPUT_DIRECTORY)?),
                file_prefix: text("INGEST_FILE_PREFIX", DEFAULT_FILE_PREFIX)?,
                file_suffix: text("INGEST_FILE_SUFFIX", DEFAULT_FILE_SUFFIX)?,
                chunk_size: usize::try_from(number("INGEST_CHUNK_SIZE", DEFAULT_CHUNK_SIZE as u64)?)?,
                worker_count: usize::try_from(number(
                    "INGEST_WORKER_COUNT",
                    DEFAULT_WORKER_COUNT as u64,
                )?)?,
                max_concurrent_jobs: usize::try_from(number(
                    "INGEST_MAX_CONCURRENT_JOBS",
                    DEFAULT_MAX_CONCURRENT_JOBS as u64,
                )?)?,
                reply_timeout_secs: number("INGEST_REPLY_TIMEOUT_SECS", DEFAULT_REPLY_TIMEOUT_SECS)?,
                worker_id: parsed("QUAKE_WORKER_ID"),
            },
            cors: CorsConfig {
                allowed_origins: text("CORS_ALLOWED_ORIGINS", DEFAULT_CORS_ALLOWED_ORIGIN)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: parsed("CORS_ALLOW_CREDENTIALS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(false),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        let queues = [
            &self.broker.job_requests_queue,
            &self.broker.worker_requests_queue,
            &self.broker.worker_replies_queue,
        ];
        if queues[0] == queues[1] || queues[0] == queues[2] || queues[1] == queues[2] {
            anyhow::bail!("Broker queue names must be distinct");
        }

        if self.broker.max_deliveries < 1 {
            anyhow::bail!("BROKER_MAX_DELIVERIES must be at least 1");
        }

        if self.broker.visibility_timeout_secs == 0 {
            anyhow::bail!("BROKER_VISIBILITY_TIMEOUT_SECS must be greater than 0");
        }

        if self.ingest.chunk_size == 0 || self.ingest.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "INGEST_CHUNK_SIZE must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE,
                self.ingest.chunk_size
            );
        }

        if self.ingest.worker_count == 0 {
            anyhow::bail!("INGEST_WORKER_COUNT must be greater than 0");
        }

        if self.ingest.max_concurrent_jobs == 0 {
            anyhow::bail!("INGEST_MAX_CONCURRENT_JOBS must be greater than 0");
        }

        if self.ingest.file_prefix.is_empty() && self.ingest.file_suffix.is_empty() {
            tracing::warn!("No file prefix or suffix configured - every file will become a partition");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let env: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let config = Config::from_lookup(|key| env.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.broker.backend, BrokerBackend::Postgres);
        assert_eq!(config.ingest.chunk_size, 100);
        assert_eq!(config.ingest.file_prefix, "earthquakes");
        assert_eq!(config.ingest.file_suffix, ".csv");
        assert_eq!(config.ingest.reply_timeout(), Some(Duration::from_secs(3600)));
        assert!(config.database.analytics_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("INGEST_CHUNK_SIZE", "250"),
            ("INGEST_REPLY_TIMEOUT_SECS", "90"),
            ("BROKER_BACKEND", "memory"),
            ("QUAKE_WORKER_ID", "worker-eu-1"),
            ("ANALYTICS_DATABASE_URL", "postgresql://analytics/quake"),
        ])
        .unwrap();

        assert_eq!(config.ingest.chunk_size, 250);
        assert_eq!(config.ingest.reply_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.ingest.worker_id.as_deref(), Some("worker-eu-1"));
        assert_eq!(config.database.analytics_url.as_deref(), Some("postgresql://analytics/quake"));
    }

    #[test]
    fn test_zero_reply_timeout_waits_indefinitely() {
        let config = load(&[("INGEST_REPLY_TIMEOUT_SECS", "0")]).unwrap();
        assert!(config.ingest.reply_timeout().is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(load(&[("INGEST_CHUNK_SIZE", "0")]).is_err());
        assert!(load(&[("INGEST_CHUNK_SIZE", "lots")]).is_err());
        assert!(load(&[("INGEST_CHUNK_SIZE", "100000")]).is_err());
        assert!(load(&[("BROKER_BACKEND", "kafka")]).is_err());
        assert!(load(&[("BROKER_MAX_DELIVERIES", "0")]).is_err());
        assert!(load(&[("BROKER_WORKER_REPLIES_QUEUE", "worker-requests")]).is_err());
        assert!(load(&[("QUAKE_PORT", "70000")]).is_err());
    }
}
