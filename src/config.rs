use std::env;
use std::str::FromStr;
use tokio::time::Duration;

use crate::error::ConfigError;
use crate::protocol::codec::TARGET_NAME;

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 2;
const DEFAULT_COMMAND_DELAY_MS: u64 = 500;
const DEFAULT_MEASUREMENT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Case-sensitive prefix of the advertised device name
    pub name_prefix: String,
    pub scan_timeout: Duration,
    /// Upper bound on the wait for each query response
    pub command_delay: Duration,
    /// Observation window after the weight measurement starts
    pub measurement_window: Duration,
    /// Write StopWeightMeasurement before disconnecting
    pub stop_on_exit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name_prefix: TARGET_NAME.to_string(),
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            command_delay: Duration::from_millis(DEFAULT_COMMAND_DELAY_MS),
            measurement_window: Duration::from_secs(DEFAULT_MEASUREMENT_SECS),
            stop_on_exit: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key/value source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SessionConfig::default();

        let name_prefix = lookup("PROGRESSOR_NAME_PREFIX")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.name_prefix);

        let scan_timeout = parse_var(&lookup, "PROGRESSOR_SCAN_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.scan_timeout);

        let command_delay = parse_var(&lookup, "PROGRESSOR_COMMAND_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.command_delay);

        let measurement_window = parse_var(&lookup, "PROGRESSOR_MEASUREMENT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.measurement_window);

        let stop_on_exit = match lookup("PROGRESSOR_STOP_ON_EXIT") {
            Some(value) => parse_flag("PROGRESSOR_STOP_ON_EXIT", &value)?,
            None => defaults.stop_on_exit,
        };

        Ok(SessionConfig {
            name_prefix,
            scan_timeout,
            command_delay,
            measurement_window,
            stop_on_exit,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
