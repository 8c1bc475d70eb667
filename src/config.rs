use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const MIN_REFRESH_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct Config {
    pub binary_name: String,
    pub command_timeout: Duration,
    pub refresh_interval: Duration,
    pub log_lines: u32,
    pub extra_search_paths: Vec<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
    /// The requested refresh interval when it was below the minimum and got raised.
    pub clamped_refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            _ => Err(anyhow::anyhow!("Invalid log format: {}. Valid options are 'json', 'text'.", s)),
        }
    }
}

pub fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary_name: "pm2".to_string(),
            command_timeout: Duration::from_millis(15_000),
            refresh_interval: Duration::from_millis(5_000),
            log_lines: 200,
            extra_search_paths: Vec::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            clamped_refresh_interval: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let binary_name = var("PM2_DECK_BINARY").unwrap_or(defaults.binary_name);

        let command_timeout = match var("PM2_DECK_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>().context(format!("Invalid PM2_DECK_TIMEOUT_MS: {}", raw))?,
            ),
            None => defaults.command_timeout,
        };
        if command_timeout.is_zero() {
            anyhow::bail!("PM2_DECK_TIMEOUT_MS must be greater than zero");
        }

        let mut refresh_interval = match var("PM2_DECK_REFRESH_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>().context(format!("Invalid PM2_DECK_REFRESH_INTERVAL_MS: {}", raw))?,
            ),
            None => defaults.refresh_interval,
        };
        let mut clamped_refresh_interval = None;
        if refresh_interval < Duration::from_millis(MIN_REFRESH_INTERVAL_MS) {
            clamped_refresh_interval = Some(refresh_interval);
            refresh_interval = Duration::from_millis(MIN_REFRESH_INTERVAL_MS);
        }

        let log_lines = match var("PM2_DECK_LOG_LINES") {
            Some(raw) => raw.parse::<u32>().context(format!("Invalid PM2_DECK_LOG_LINES: {}", raw))?,
            None => defaults.log_lines,
        };

        let extra_search_paths = var("PM2_DECK_EXTRA_PATHS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(expand_tilde)
            .collect();

        let log_level = var("LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_format = match var("LOG_FORMAT") {
            Some(raw) => LogFormat::from_str(&raw)?,
            None => defaults.log_format,
        };

        Ok(Config {
            binary_name,
            command_timeout,
            refresh_interval,
            log_lines,
            extra_search_paths,
            log_level,
            log_format,
            clamped_refresh_interval,
        })
    }

    /// Reports values that were adjusted while loading. Call once logging is up.
    pub fn log_adjustments(&self) {
        if let Some(requested) = self.clamped_refresh_interval {
            warn!(
                requested_ms = requested.as_millis() as u64,
                "Refresh interval too small, clamping to {}ms", MIN_REFRESH_INTERVAL_MS
            );
        }
    }
}
