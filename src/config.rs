use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_FEED_BASE_URL: &str = "http://api.transilien.com";
const DEFAULT_FEED_TIMEOUT_SECS: u64 = 30;
/// A train number is reused every service day
const MAX_DEDUP_WINDOW_HOURS: u64 = 24;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite URL, e.g. `sqlite://data/trains.db`. The file is created if missing.
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Max delay before a re-sighted train number is treated as a different train
    #[serde(default = "default_dedup_window_hours")]
    pub dedup_window_hours: u64,
    /// When set, `serve` also polls the feed on this interval
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    pub stations: Stations,
    pub feed: FeedConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
}

/// The two directional endpoints of the watched route
#[derive(Debug, Clone, Deserialize)]
pub struct Stations {
    pub from: Station,
    pub to: Station,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Station {
    pub code: String,
    pub label: String,
}

impl Stations {
    /// Human label for a station code, if it is one of the two endpoints
    pub fn label_for(&self, code: &str) -> Option<&str> {
        if code == self.from.code {
            Some(&self.from.label)
        } else if code == self.to.code {
            Some(&self.to.label)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_base_url")]
    pub base_url: String,
    pub login: String,
    pub password: String,
    #[serde(default = "default_feed_timeout_secs")]
    pub timeout_secs: u64,
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Emit a log event for every notification
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub pushbullet: Option<PushbulletConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log: true,
            pushbullet: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushbulletConfig {
    pub api_key: String,
    /// Channel tag the note is pushed to
    pub channel: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_dedup_window_hours() -> u64 {
    crate::time_codec::DEFAULT_DEDUP_WINDOW_HOURS as u64
}

fn default_feed_base_url() -> String {
    DEFAULT_FEED_BASE_URL.to_string()
}

fn default_feed_timeout_secs() -> u64 {
    DEFAULT_FEED_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stations.from.code == self.stations.to.code {
            return Err(ConfigError::Invalid(format!(
                "from and to stations must differ (both are {})",
                self.stations.from.code
            )));
        }
        if !(1..=MAX_DEDUP_WINDOW_HOURS).contains(&self.dedup_window_hours) {
            return Err(ConfigError::Invalid(format!(
                "dedup_window_hours must be between 1 and {MAX_DEDUP_WINDOW_HOURS} (got {})",
                self.dedup_window_hours
            )));
        }
        if self.poll_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedup_window_hours as i64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
