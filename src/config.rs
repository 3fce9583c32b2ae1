use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable that overrides `efs.password` from the config file.
pub const PASSWORD_ENV: &str = "FUELSYNC_PASSWORD";

/// Largest accepted `batch_size_days` or `lookback_days`.
pub const MAX_SPAN_DAYS: i64 = 36_500;

/// Largest accepted delay or backoff, in seconds.
pub const MAX_WAIT_SECONDS: f64 = 86_400.0;

/// Seconds to `Duration`, clamped to `[0, MAX_WAIT_SECONDS]`. NaN maps to zero.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_WAIT_SECONDS)).unwrap_or(Duration::ZERO)
}

/// Complete runtime configuration, loaded from `config.toml`.
#[derive(Clone, Deserialize, Serialize)]
pub struct FuelSyncConfig {
    pub efs: EfsSection,
    #[serde(default)]
    pub client: ClientSection,
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct EfsSection {
    pub endpoint_url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSection {
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub verify_ssl: bool,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
    pub max_backoff_seconds: f64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            read_timeout_seconds: 60,
            verify_ssl: true,
            max_retries: 3,
            retry_backoff_factor: 2.0,
            max_backoff_seconds: 60.0,
        }
    }
}

impl ClientSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSection {
    pub default_start_date: NaiveDate,
    #[serde(default = "default_batch_size_days")]
    pub batch_size_days: i64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default)]
    pub request_delay_seconds: f64,
}

fn default_batch_size_days() -> i64 {
    1
}

fn default_lookback_days() -> i64 {
    7
}

impl PipelineSection {
    pub fn request_delay(&self) -> Duration {
        seconds(self.request_delay_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: PathBuf,
    pub compression: Compression,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_dir().join("fuelsync.db"),
            compression: Compression::None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl fmt::Debug for EfsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EfsSection")
            .field("endpoint_url", &self.endpoint_url)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

impl fmt::Debug for FuelSyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuelSyncConfig")
            .field("efs", &self.efs)
            .field("client", &self.client)
            .field("pipeline", &self.pipeline)
            .field("storage", &self.storage)
            .field("logging", &self.logging)
            .finish()
    }
}

/// `~/.fuelsync`, or `./.fuelsync` when no home directory is known.
pub fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fuelsync")
}

pub fn default_config_path() -> PathBuf {
    default_dir().join("config.toml")
}

impl FuelSyncConfig {
    /// Load from the default location (`~/.fuelsync/config.toml`).
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load, apply environment overrides, and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                config.efs.password = password;
            }
        }
        config.storage.database_path = expand_home(&config.storage.database_path);
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse without validation or environment overrides.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(Error::Config("configuration file is empty".into()));
        }
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = url::Url::parse(&self.efs.endpoint_url)
            .map_err(|e| Error::Config(format!("efs.endpoint_url is not a valid URL: {e}")))?;
        if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
            return Err(Error::Config(format!(
                "efs.endpoint_url must be http or https, got {}",
                endpoint.scheme()
            )));
        }
        if self.efs.username.trim().is_empty() {
            return Err(Error::Config("efs.username must not be empty".into()));
        }
        if self.efs.password.is_empty() {
            return Err(Error::Config(format!(
                "efs.password must be set in the config file or {PASSWORD_ENV}"
            )));
        }
        if self.client.connect_timeout_seconds == 0 || self.client.read_timeout_seconds == 0 {
            return Err(Error::Config("client timeouts must be greater than zero".into()));
        }
        if !self.client.retry_backoff_factor.is_finite() || self.client.retry_backoff_factor < 0.0 {
            return Err(Error::Config("client.retry_backoff_factor must be >= 0".into()));
        }
        if !(0.0..=MAX_WAIT_SECONDS).contains(&self.client.max_backoff_seconds) {
            return Err(Error::Config(format!(
                "client.max_backoff_seconds must be between 0 and {MAX_WAIT_SECONDS}"
            )));
        }
        if !(1..=MAX_SPAN_DAYS).contains(&self.pipeline.batch_size_days) {
            return Err(Error::Config(format!(
                "pipeline.batch_size_days must be between 1 and {MAX_SPAN_DAYS}"
            )));
        }
        if !(0..=MAX_SPAN_DAYS).contains(&self.pipeline.lookback_days) {
            return Err(Error::Config(format!(
                "pipeline.lookback_days must be between 0 and {MAX_SPAN_DAYS}"
            )));
        }
        if !(0.0..=MAX_WAIT_SECONDS).contains(&self.pipeline.request_delay_seconds) {
            return Err(Error::Config(format!(
                "pipeline.request_delay_seconds must be between 0 and {MAX_WAIT_SECONDS}"
            )));
        }
        Ok(())
    }

    /// TOML rendering with the password masked, for `config show`.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        copy.efs.password = "********".into();
        toml::to_string_pretty(&copy).map_err(|e| Error::Config(e.to_string()))
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
pub(crate) fn test_config(endpoint: &str) -> FuelSyncConfig {
    FuelSyncConfig {
        efs: EfsSection {
            endpoint_url: endpoint.to_string(),
            username: "fleet".to_string(),
            password: "secret".to_string(),
        },
        client: ClientSection {
            max_retries: 2,
            retry_backoff_factor: 2.0,
            ..ClientSection::default()
        },
        pipeline: PipelineSection {
            default_start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            batch_size_days: 1,
            lookback_days: 7,
            request_delay_seconds: 0.0,
        },
        storage: StorageSection::default(),
        logging: LoggingSection::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[efs]
endpoint_url = "https://ws.efsllc.com/axis2/services/CardManagementWS/"
username = "fleet"
password = "secret"

[client]
max_retries = 5
retry_backoff_factor = 1.5

[pipeline]
default_start_date = "2025-06-01"
batch_size_days = 2
lookback_days = 7
request_delay_seconds = 0.5

[storage]
database_path = "/tmp/fuelsync.db"
compression = "gzip"
"#;

    #[test]
    fn test_parse_sample() {
        let config = FuelSyncConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.client.max_retries, 5);
        assert_eq!(config.client.read_timeout_seconds, 60);
        assert_eq!(config.pipeline.batch_size_days, 2);
        assert_eq!(
            config.pipeline.default_start_date,
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
        );
        assert_eq!(config.storage.compression, Compression::Gzip);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(FuelSyncConfig::parse("  \n"), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_section_rejected() {
        let result = FuelSyncConfig::parse("[efs]\nendpoint_url = \"https://x\"\nusername = \"u\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = test_config("https://example.com/ws");
        config.validate().unwrap();

        config.pipeline.batch_size_days = 0;
        assert!(config.validate().is_err());
        config.pipeline.batch_size_days = 1;

        config.pipeline.lookback_days = -1;
        assert!(config.validate().is_err());
        config.pipeline.lookback_days = 14;
        config.validate().unwrap();

        config.efs.endpoint_url = "ftp://example.com".into();
        assert!(config.validate().is_err());
        config.efs.endpoint_url = "not a url".into();
        assert!(config.validate().is_err());
        config.efs.endpoint_url = "https://example.com/ws".into();

        config.efs.password.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_upper_bounds() {
        let mut config = test_config("https://example.com/ws");

        config.pipeline.batch_size_days = MAX_SPAN_DAYS;
        config.pipeline.lookback_days = MAX_SPAN_DAYS;
        config.validate().unwrap();

        config.pipeline.batch_size_days = 1_000_000_000;
        assert!(config.validate().is_err());
        config.pipeline.batch_size_days = 1;

        config.pipeline.lookback_days = 1_000_000_000;
        assert!(config.validate().is_err());
        config.pipeline.lookback_days = 7;

        config.pipeline.request_delay_seconds = 1e20;
        assert!(config.validate().is_err());
        config.pipeline.request_delay_seconds = f64::NAN;
        assert!(config.validate().is_err());
        config.pipeline.request_delay_seconds = 0.0;

        config.client.max_backoff_seconds = 1e20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_waits_are_clamped() {
        let mut config = test_config("https://example.com/ws");
        config.pipeline.request_delay_seconds = 1e20;
        assert_eq!(config.pipeline.request_delay(), Duration::from_secs(86_400));
        config.pipeline.request_delay_seconds = f64::NAN;
        assert_eq!(config.pipeline.request_delay(), Duration::ZERO);
        config.pipeline.request_delay_seconds = -3.0;
        assert_eq!(config.pipeline.request_delay(), Duration::ZERO);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = test_config("https://example.com/ws");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("********"));

        let toml = config.to_redacted_toml().unwrap();
        assert!(!toml.contains("secret"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = FuelSyncConfig::load_from(&path).unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/fuelsync.db"));

        let missing = FuelSyncConfig::load_from(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
