use crate::compose::DEFAULT_APP_URL;
use crate::errors::ConfigError;
use crate::runner::DEFAULT_NUM_WORKERS;
use std::time::Duration;

/// Dispatch settings loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Jobs processed concurrently by this process.
    pub num_workers: usize,
    /// How often idle workers poll for due jobs.
    pub poll_interval: Duration,
    /// Maximum random jitter added to each poll.
    pub jitter: Duration,
    /// Ignore quiet hours, for manual or administrative triggers.
    pub quiet_hours_override: bool,
    /// Base URL for deep links into the app.
    pub app_url: String,
    /// Archive finished queue rows instead of deleting them.
    pub archive_completed_jobs: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            poll_interval: Duration::from_millis(1000),
            jitter: Duration::from_millis(100),
            quiet_hours_override: false,
            app_url: DEFAULT_APP_URL.to_owned(),
            archive_completed_jobs: false,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from the environment, reading `.env` first if present.
    ///
    /// | Env Var                        | Default     |
    /// |--------------------------------|-------------|
    /// | `NUDGES_WORKERS`               | `5`         |
    /// | `NUDGES_POLL_INTERVAL_MS`      | `1000`      |
    /// | `NUDGES_POLL_JITTER_MS`        | `100`       |
    /// | `NUDGES_QUIET_HOURS_OVERRIDE`  | `false`     |
    /// | `NUDGES_APP_URL`               | `nudges://` |
    /// | `NUDGES_ARCHIVE_COMPLETED`     | `false`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let num_workers = match lookup("NUDGES_WORKERS") {
            Some(value) => parse_count("NUDGES_WORKERS", value)?,
            None => defaults.num_workers,
        };
        let poll_interval = match lookup("NUDGES_POLL_INTERVAL_MS") {
            Some(value) => parse_millis("NUDGES_POLL_INTERVAL_MS", value)?,
            None => defaults.poll_interval,
        };
        let jitter = match lookup("NUDGES_POLL_JITTER_MS") {
            Some(value) => parse_millis("NUDGES_POLL_JITTER_MS", value)?,
            None => defaults.jitter,
        };
        let quiet_hours_override = match lookup("NUDGES_QUIET_HOURS_OVERRIDE") {
            Some(value) => parse_flag("NUDGES_QUIET_HOURS_OVERRIDE", value)?,
            None => defaults.quiet_hours_override,
        };
        let archive_completed_jobs = match lookup("NUDGES_ARCHIVE_COMPLETED") {
            Some(value) => parse_flag("NUDGES_ARCHIVE_COMPLETED", value)?,
            None => defaults.archive_completed_jobs,
        };
        let app_url = lookup("NUDGES_APP_URL")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.app_url);

        Ok(Self {
            num_workers,
            poll_interval,
            jitter,
            quiet_hours_override,
            app_url,
            archive_completed_jobs,
        })
    }
}

fn parse_count(name: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(ConfigError::Invalid {
            name,
            value,
            expected: "a positive integer",
        }),
    }
}

fn parse_millis(name: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected: "a number of milliseconds",
        })
}

fn parse_flag(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value,
            expected: "a boolean",
        }),
    }
}
