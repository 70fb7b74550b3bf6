use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::worker::{MAX_POLL_INTERVAL, WorkerOptions};

/// Longest accepted wait for an in-flight run during process shutdown.
pub const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    /// Upper bound on how long the idle worker waits before re-checking for exit.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a SIGINT/SIGTERM shutdown waits for an in-flight run.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskConfig {
    #[serde(default = "default_task_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("poll-interval must be greater than zero")]
    ZeroPollInterval,
    #[error("poll-interval must not exceed {max:?}")]
    PollIntervalTooLong { max: Duration },
    #[error("shutdown-grace must not exceed {max:?}")]
    ShutdownGraceTooLong { max: Duration },
    #[error("task.command must name a program")]
    EmptyTaskCommand,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let cfg: Config = serde_yaml::from_slice(&data)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Loads the configuration the binary runs with.
    ///
    /// An explicit `path` must exist. Without one, `default_path` is read when
    /// present and built-in defaults are used otherwise. The bind address is
    /// then overridden by `env_bind` and finally by `cli_bind`.
    pub fn resolve(
        path: Option<&Path>,
        default_path: &Path,
        env_bind: Option<&str>,
        cli_bind: Option<SocketAddr>,
    ) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::load(path)?,
            None if default_path.exists() => Self::load(default_path)?,
            None => {
                info!(path = %default_path.display(), "no config file; using defaults");
                Self::default()
            }
        };
        if let Some(value) = env_bind {
            cfg.bind_address = value
                .trim()
                .parse()
                .with_context(|| format!("invalid bind address {value:?}"))?;
        }
        if let Some(bind) = cli_bind {
            cfg.bind_address = bind;
        }
        Ok(cfg)
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(ConfigError::PollIntervalTooLong {
                max: MAX_POLL_INTERVAL,
            });
        }
        if self.shutdown_grace > MAX_SHUTDOWN_GRACE {
            return Err(ConfigError::ShutdownGraceTooLong {
                max: MAX_SHUTDOWN_GRACE,
            });
        }
        if self.task.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ConfigError::EmptyTaskCommand);
        }
        Ok(self)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_interval: self.poll_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            poll_interval: default_poll_interval(),
            shutdown_grace: default_shutdown_grace(),
            task: TaskConfig::default(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command: default_task_command(),
            working_dir: None,
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_task_command() -> Vec<String> {
    vec!["sleep".to_string(), "10".to_string()]
}
