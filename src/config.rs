use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cleanup::CleanupSettings;
use crate::limits::MAX_RETENTION_DAYS;

/// Server settings, read once from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub cleanup: CleanupSettings,
    /// JSON seed for rooms and users.
    pub directory_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let retention_days: u32 = parse_num(&get, "ROOMBOOK_RETENTION_DAYS", 10)?;
        if !(1..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(ConfigError::Invalid(
                "ROOMBOOK_RETENTION_DAYS",
                format!("must be 1..={MAX_RETENTION_DAYS}"),
            ));
        }
        let cleanup_hour: u32 = parse_num(&get, "ROOMBOOK_CLEANUP_HOUR", 2)?;
        if cleanup_hour > 23 {
            return Err(ConfigError::Invalid(
                "ROOMBOOK_CLEANUP_HOUR",
                "must be 0..=23".into(),
            ));
        }
        let store_timeout_ms: u64 = parse_num(&get, "ROOMBOOK_STORE_TIMEOUT_MS", 5000)?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ROOMBOOK_STORE_TIMEOUT_MS",
                "must be positive".into(),
            ));
        }

        Ok(Self {
            bind: string("ROOMBOOK_BIND", "0.0.0.0"),
            port: parse_num(&get, "ROOMBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(string("ROOMBOOK_DATA_DIR", "./data")),
            password: string("ROOMBOOK_PASSWORD", "roombook"),
            max_connections: parse_num(&get, "ROOMBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_num(&get, "ROOMBOOK_COMPACT_THRESHOLD", 1000)?,
            store_timeout: Duration::from_millis(store_timeout_ms),
            cleanup: CleanupSettings {
                retention_days,
                cleanup_hour,
                auto_enabled: parse_bool(&get, "ROOMBOOK_AUTO_CLEANUP", true)?,
            },
            directory_file: get("ROOMBOOK_DIRECTORY_FILE").map(PathBuf::from),
            metrics_port: get("ROOMBOOK_METRICS_PORT")
                .map(|s| {
                    s.parse()
                        .map_err(|_| ConfigError::Invalid("ROOMBOOK_METRICS_PORT", s.clone()))
                })
                .transpose()?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse_num<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(s) => s.trim().parse().map_err(|_| ConfigError::Invalid(key, s)),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(s) => match s.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, s)),
        },
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, value) => write!(f, "invalid {key}: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
