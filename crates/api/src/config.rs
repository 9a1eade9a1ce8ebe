//! API process configuration, read from the environment.

use std::net::SocketAddr;

use tracing::warn;

use hopline_events::queues::DEFAULT_QUEUE_PREFIX;
use hopline_events::DEFAULT_SUBSCRIBER_BUFFER;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub addr: SocketAddr,
    /// Postgres job store; in-memory when absent.
    pub database_url: Option<String>,
    /// Enqueue the first hop on create; jobs are only recorded when absent.
    pub redis_url: Option<String>,
    pub queue_prefix: String,
    pub subscriber_buffer: usize,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let addr = match get("HOPLINE_API_ADDR") {
            Some(raw) => raw.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "HOPLINE_API_ADDR",
                reason: e.to_string(),
            })?,
            None => {
                warn!(default = DEFAULT_ADDR, "HOPLINE_API_ADDR not set; using default");
                DEFAULT_ADDR.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                    key: "HOPLINE_API_ADDR",
                    reason: e.to_string(),
                })?
            }
        };

        let subscriber_buffer = match get("HOPLINE_SUBSCRIBER_BUFFER") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        key: "HOPLINE_SUBSCRIBER_BUFFER",
                        reason: "must be at least 1".to_string(),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        key: "HOPLINE_SUBSCRIBER_BUFFER",
                        reason: e.to_string(),
                    });
                }
            },
            None => DEFAULT_SUBSCRIBER_BUFFER,
        };

        let database_url = get("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set; jobs are kept in memory only");
        }
        let redis_url = get("REDIS_URL");
        if redis_url.is_none() {
            warn!("REDIS_URL not set; created jobs will not be enqueued");
        }

        Ok(Self {
            addr,
            database_url,
            redis_url,
            queue_prefix: get("HOPLINE_QUEUE_PREFIX").unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
            subscriber_buffer,
        })
    }
}
