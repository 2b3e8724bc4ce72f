//! Controller configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `KUBEXT_EXECUTOR_IMAGE` | `ghcr.io/kubext/executor:latest` |
//! | `KUBEXT_EXECUTOR_BACKOFF_LIMIT` | `0` |
//! | `KUBEXT_EXECUTION_TIMEOUT_SECONDS` | `1800` |
//! | `KUBEXT_EXECUTION_DEADLINE_SECONDS` | unset (watchdog off) |
//! | `KUBEXT_CONCURRENCY` | `4` |
//! | `KUBEXT_STATUS_RETRIES` | `5` |
//! | `KUBEXT_RESYNC_SECONDS` | `300` |
//! | `KUBEXT_NAMESPACE` | `kubext-system` |
//! | `KUBEXT_LEADER_ELECTION` | `false` (`true` or `1` enables) |

use crate::controller::installplan::dispatch::ExecutorSettings;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_EXECUTOR_IMAGE: &str = "ghcr.io/kubext/executor:latest";
pub const DEFAULT_NAMESPACE: &str = "kubext-system";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub executor: ExecutorSettings,
    /// Fail executions stuck longer than this; `None` disables the watchdog
    pub execution_deadline: Option<Duration>,
    /// Maximum InstallPlans reconciled at once
    pub concurrency: u16,
    /// Attempts for a status write before giving up on conflicts
    pub status_retries: u32,
    /// Requeue interval for settled plans
    pub resync_interval: Duration,
    /// Namespace the controller runs in
    pub namespace: String,
    /// Run only while holding the leader Lease
    pub leader_election: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorSettings {
                image: DEFAULT_EXECUTOR_IMAGE.to_string(),
                backoff_limit: 0,
                active_deadline_seconds: 1800,
            },
            execution_deadline: None,
            concurrency: 4,
            status_retries: 5,
            resync_interval: Duration::from_secs(300),
            namespace: DEFAULT_NAMESPACE.to_string(),
            leader_election: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let executor = ExecutorSettings {
            image: lookup("KUBEXT_EXECUTOR_IMAGE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.executor.image),
            backoff_limit: parse(&lookup, "KUBEXT_EXECUTOR_BACKOFF_LIMIT")?
                .unwrap_or(defaults.executor.backoff_limit),
            active_deadline_seconds: parse(&lookup, "KUBEXT_EXECUTION_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.executor.active_deadline_seconds),
        };

        Ok(Self {
            executor,
            execution_deadline: parse(&lookup, "KUBEXT_EXECUTION_DEADLINE_SECONDS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            concurrency: parse(&lookup, "KUBEXT_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            status_retries: parse(&lookup, "KUBEXT_STATUS_RETRIES")?
                .unwrap_or(defaults.status_retries),
            resync_interval: parse(&lookup, "KUBEXT_RESYNC_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.resync_interval),
            namespace: lookup("KUBEXT_NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.namespace),
            leader_election: lookup("KUBEXT_LEADER_ELECTION")
                .map(|v| matches!(v.trim(), "true" | "1"))
                .unwrap_or(defaults.leader_election),
        })
    }
}

fn parse<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
    }
}
