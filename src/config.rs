use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where and how to reach the occupancy provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub spots_file: Option<PathBuf>,
    pub sync_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub provider: ProviderConfig,
}

const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("PPM_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("PPM_URL"))?;
        let username = lookup("PPM_AUTH_USERNAME").unwrap_or_else(|| {
            warn!("PPM_AUTH_USERNAME not set, provider requests use an empty username");
            String::new()
        });
        let password = lookup("PPM_AUTH_PASSWORD").unwrap_or_default();

        let timeout_secs: u64 = try_load(&lookup, "SPOTWATCH_FETCH_TIMEOUT_SECS", "10")?;
        let sync_secs: u64 = try_load(&lookup, "SPOTWATCH_SYNC_INTERVAL_SECS", "60")?;
        if sync_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SPOTWATCH_SYNC_INTERVAL_SECS",
                value: "0".into(),
                reason: "interval must be positive".into(),
            });
        }

        Ok(Self {
            port: try_load(&lookup, "SPOTWATCH_PORT", "8080")?,
            bind: try_load(&lookup, "SPOTWATCH_BIND", "0.0.0.0")?,
            data_dir: try_load(&lookup, "SPOTWATCH_DATA_DIR", "./data")?,
            spots_file: lookup("SPOTWATCH_SPOTS_FILE").map(PathBuf::from),
            sync_interval: Duration::from_secs(sync_secs),
            compact_threshold: try_load(&lookup, "SPOTWATCH_COMPACT_THRESHOLD", "1000")?,
            metrics_port: optional(&lookup, "SPOTWATCH_METRICS_PORT")?,
            provider: ProviderConfig {
                base_url,
                username,
                password,
                timeout: Duration::from_secs(timeout_secs),
                retries: try_load(&lookup, "SPOTWATCH_FETCH_RETRIES", "2")?,
                backoff: DEFAULT_BACKOFF,
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spotwatch.wal")
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }
    })
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    parse(key, value)
}

fn optional<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    lookup(key).map(|value| parse(key, value)).transpose()
}
