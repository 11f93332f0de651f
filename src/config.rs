//! Configuration management for schedules.
//!
//! Configuration can be set via environment variables:
//! - `SCHEDULE_TIMEOUT_MS` - Optional. Inactivity timeout in milliseconds. Defaults to `5000`.
//!   `0` or `none` disables the timeout.
//! - `SCHEDULE_REQUEST_TOLERANCE` - Optional. How many top-level tasks an out-of-band
//!   request may lag behind its declaration. Defaults to `1`.
//! - `SCHEDULE_SERVER_HOST` - Optional. Request validator listener host. Defaults to `127.0.0.1`.
//! - `SCHEDULE_SERVER_PORT` - Optional. Request validator listener port. Defaults to `0` (any free port).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TOLERANCE: usize = 1;

/// Schedule configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Inactivity timeout; `None` lets a schedule run forever
    pub timeout: Option<Duration>,

    /// Permitted lag, in top-level tasks, between declaring an expected
    /// request and receiving it
    pub request_tolerance: usize,

    /// Request validator listener host
    pub server_host: String,

    /// Request validator listener port
    pub server_port: u16,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            request_tolerance: DEFAULT_REQUEST_TOLERANCE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
        }
    }
}

impl ScheduleConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let timeout = match lookup("SCHEDULE_TIMEOUT_MS") {
            None => defaults.timeout,
            Some(value) => parse_timeout(&value)?,
        };

        let request_tolerance = lookup("SCHEDULE_REQUEST_TOLERANCE")
            .map(|value| {
                value.trim().parse().map_err(|e| {
                    ConfigError::InvalidValue(
                        "SCHEDULE_REQUEST_TOLERANCE".to_string(),
                        format!("{}", e),
                    )
                })
            })
            .transpose()?
            .unwrap_or(defaults.request_tolerance);

        let server_host = lookup("SCHEDULE_SERVER_HOST").unwrap_or(defaults.server_host);

        let server_port = lookup("SCHEDULE_SERVER_PORT")
            .map(|value| {
                value.trim().parse().map_err(|e| {
                    ConfigError::InvalidValue("SCHEDULE_SERVER_PORT".to_string(), format!("{}", e))
                })
            })
            .transpose()?
            .unwrap_or(defaults.server_port);

        Ok(Self {
            timeout,
            request_tolerance,
            server_host,
            server_port,
        })
    }

    /// Listener address in `host:port` form.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_timeout(value: &str) -> Result<Option<Duration>, ConfigError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let millis: u64 = trimmed.parse().map_err(|e| {
        ConfigError::InvalidValue("SCHEDULE_TIMEOUT_MS".to_string(), format!("{}", e))
    })?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}
