//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::PathBuf;
use std::time::Duration;

/// Application name; sessions live under `<base_dir>/<app_name>/`.
pub const APP_NAME: &str = "perles";

/// Perles configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base data directory. Sessions live under `<base_dir>/<app_name>/`.
    pub base_dir: PathBuf,

    /// Application name used for the on-disk layout and session index.
    pub app_name: String,

    /// Inclusive port range workers and the coordinator are allocated from.
    pub port_start: u16,
    pub port_end: u16,

    /// Notification debounce window.
    pub debounce: Duration,

    /// Grace period before a graceful stop escalates to a kill.
    pub grace_period: Duration,

    /// External agent runtime invoked per process.
    pub runtime: RuntimeConfig,

    /// Bounded queue capacities.
    pub event_queue_capacity: usize,
    pub command_queue_capacity: usize,

    /// Recent-log ring buffer capacity.
    pub log_buffer_capacity: usize,

    /// Number of workers spawned at session start.
    pub initial_workers: usize,
}

/// External agent runtime configuration. The runtime binary is launched once
/// per process; it receives the path to its MCP config in `PERLES_MCP_CONFIG`
/// and reads prompts line-delimited on stdin.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn load() -> Result<Self> {
        let base_dir = match std::env::var("PERLES_BASE_DIR") {
            Ok(value) => PathBuf::from(value),
            Err(_) => dirs::data_dir().unwrap_or_else(|| PathBuf::from("./data")),
        };

        std::fs::create_dir_all(base_dir.join(APP_NAME))
            .with_context(|| format!("failed to create data directory under {}", base_dir.display()))?;

        let port_start = env_parse("PERLES_PORT_START", 9100u16)?;
        let port_end = env_parse("PERLES_PORT_END", 9199u16)?;
        if port_start > port_end {
            return Err(ConfigError::InvalidPortRange {
                start: port_start,
                end: port_end,
            }
            .into());
        }

        let runtime_command =
            std::env::var("PERLES_RUNTIME_CMD").unwrap_or_else(|_| "claude".to_string());
        let runtime_args = std::env::var("PERLES_RUNTIME_ARGS")
            .map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            base_dir,
            app_name: APP_NAME.to_string(),
            port_start,
            port_end,
            debounce: Duration::from_millis(env_parse("PERLES_DEBOUNCE_MS", 250u64)?),
            grace_period: Duration::from_secs(env_parse("PERLES_GRACE_PERIOD_SECS", 10u64)?),
            runtime: RuntimeConfig {
                command: runtime_command,
                args: runtime_args,
            },
            event_queue_capacity: env_parse("PERLES_EVENT_QUEUE", 1024usize)?,
            command_queue_capacity: env_parse("PERLES_COMMAND_QUEUE", 256usize)?,
            log_buffer_capacity: env_parse("PERLES_LOG_BUFFER", 500usize)?,
            initial_workers: env_parse("PERLES_WORKERS", 2usize)?,
        })
    }

    /// Directory holding all sessions for this application.
    pub fn app_dir(&self) -> PathBuf {
        self.base_dir.join(&self.app_name)
    }

    /// Directory for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.app_dir().join(session_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            app_name: APP_NAME.to_string(),
            port_start: 9100,
            port_end: 9199,
            debounce: Duration::from_millis(250),
            grace_period: Duration::from_secs(10),
            runtime: RuntimeConfig {
                command: "claude".to_string(),
                args: Vec::new(),
            },
            event_queue_capacity: 1024,
            command_queue_capacity: 256,
            log_buffer_capacity: 500,
            initial_workers: 2,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|error| {
            ConfigError::Invalid(format!("{key}={value}: {error}")).into()
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_consistent() {
        let config = Config::default();
        assert!(config.port_start <= config.port_end);
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(
            config.session_dir("abc"),
            PathBuf::from("./data/perles/abc")
        );
    }
}
