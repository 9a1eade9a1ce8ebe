//! Router process configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::compute::{Endpoint, DEFAULT_MAX_FRAME_BYTES};
use crate::engine::DEFAULT_STAGE_TIMEOUT;
use crate::terminal::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which queue this process consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Stage,
    Success,
    Failure,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stage" => Ok(Role::Stage),
            "success" => Ok(Role::Success),
            "failure" => Ok(Role::Failure),
            other => Err(format!("expected stage, success or failure, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub name: String,
    pub endpoint: Endpoint,
    pub timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub role: Role,
    /// Present for [`Role::Stage`] only.
    pub stage: Option<StageSettings>,
    pub redis_url: String,
    pub consumer_name: Option<String>,
    pub queue_prefix: String,
    pub concurrency: usize,
    pub status_url: Option<String>,
    pub database_url: Option<String>,
    pub retry: RetryPolicy,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let role: Role = parse_or(&get, "HOPLINE_ROLE", Role::Stage)?;
        let redis_url = get("REDIS_URL").ok_or(ConfigError::Missing("REDIS_URL"))?;

        let stage = match role {
            Role::Stage => {
                let name = get("HOPLINE_STAGE").ok_or(ConfigError::Missing("HOPLINE_STAGE"))?;
                let endpoint: Endpoint = get("HOPLINE_COMPUTE_ENDPOINT")
                    .ok_or(ConfigError::Missing("HOPLINE_COMPUTE_ENDPOINT"))?
                    .parse()
                    .map_err(|reason| ConfigError::Invalid {
                        key: "HOPLINE_COMPUTE_ENDPOINT",
                        reason,
                    })?;
                let timeout_secs: u64 =
                    parse_or(&get, "HOPLINE_STAGE_TIMEOUT_SECS", DEFAULT_STAGE_TIMEOUT.as_secs())?;
                let max_frame_bytes = parse_or(&get, "HOPLINE_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?;
                Some(StageSettings {
                    name,
                    endpoint,
                    timeout: Duration::from_secs(timeout_secs),
                    max_frame_bytes,
                })
            }
            Role::Success | Role::Failure => None,
        };

        let status_url = get("HOPLINE_STATUS_URL");
        if role != Role::Stage && status_url.is_none() {
            return Err(ConfigError::Missing("HOPLINE_STATUS_URL"));
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: parse_or(&get, "HOPLINE_MAX_RETRIES", defaults.max_retries)?,
            base_delay: Duration::from_secs(parse_or(
                &get,
                "HOPLINE_RETRY_BASE_DELAY_SECS",
                defaults.base_delay.as_secs(),
            )?),
            ..defaults
        };

        let concurrency: usize = parse_or(&get, "HOPLINE_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "HOPLINE_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            role,
            stage,
            redis_url,
            consumer_name: get("HOPLINE_CONSUMER_NAME"),
            queue_prefix: get("HOPLINE_QUEUE_PREFIX").unwrap_or_else(|| {
                hopline_events::queues::DEFAULT_QUEUE_PREFIX.to_string()
            }),
            concurrency,
            status_url,
            database_url: get("DATABASE_URL"),
            retry,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => {
            warn!(key, default = ?default, "setting not provided; using default");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<RouterConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RouterConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn stage_role_needs_a_stage_and_an_endpoint() {
        let cfg = config(&[
            ("REDIS_URL", "redis://localhost"),
            ("HOPLINE_STAGE", "infer"),
            ("HOPLINE_COMPUTE_ENDPOINT", "tcp://127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(cfg.role, Role::Stage);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.queue_prefix, "hopline");
        let stage = cfg.stage.unwrap();
        assert_eq!(stage.name, "infer");
        assert_eq!(stage.timeout, Duration::from_secs(300));

        let missing = config(&[("REDIS_URL", "redis://localhost"), ("HOPLINE_STAGE", "infer")]);
        assert!(matches!(missing, Err(ConfigError::Missing("HOPLINE_COMPUTE_ENDPOINT"))));
    }

    #[test]
    fn terminal_roles_need_the_status_api() {
        let err = config(&[("REDIS_URL", "redis://x"), ("HOPLINE_ROLE", "failure")]);
        assert!(matches!(err, Err(ConfigError::Missing("HOPLINE_STATUS_URL"))));

        let cfg = config(&[
            ("REDIS_URL", "redis://x"),
            ("HOPLINE_ROLE", "Failure"),
            ("HOPLINE_STATUS_URL", "http://api:8080"),
            ("HOPLINE_MAX_RETRIES", "5"),
            ("HOPLINE_RETRY_BASE_DELAY_SECS", "2"),
        ])
        .unwrap();
        assert_eq!(cfg.role, Role::Failure);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
        assert!(cfg.stage.is_none());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = config(&[
            ("REDIS_URL", "redis://x"),
            ("HOPLINE_ROLE", "success"),
            ("HOPLINE_STATUS_URL", "http://api"),
            ("HOPLINE_CONCURRENCY", "many"),
        ]);
        assert!(matches!(err, Err(ConfigError::Invalid { key: "HOPLINE_CONCURRENCY", .. })));
    }
}
