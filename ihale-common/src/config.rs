//! Configuration loading and resolution
//!
//! Priority order for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG: &str = "IHALE_CONFIG";
pub const ENV_PORT: &str = "IHALE_PORT";
pub const ENV_DATABASE_PATH: &str = "IHALE_DATABASE_PATH";
pub const ENV_BACKEND_URL: &str = "IHALE_BACKEND_URL";

/// Bootstrap configuration read from `ihale.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database holding the documents table
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Worker, broadcaster and stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Extraction backend endpoint
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Per-document extraction deadline
    #[serde(default = "default_document_timeout_secs")]
    pub document_timeout_secs: u64,

    /// Documents processed concurrently within one batch
    #[serde(default = "default_document_concurrency")]
    pub document_concurrency: usize,

    /// Outbound events buffered per subscriber before it is disconnected
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Period of the queue-status side channel
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// SSE heartbeat period
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// File types never sent to the backend
    #[serde(default = "default_skip_extensions")]
    pub skip_extensions: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            document_timeout_secs: default_document_timeout_secs(),
            document_concurrency: default_document_concurrency(),
            subscriber_buffer: default_subscriber_buffer(),
            status_interval_secs: default_status_interval_secs(),
            keepalive_secs: default_keepalive_secs(),
            skip_extensions: default_skip_extensions(),
        }
    }
}

impl AnalysisConfig {
    pub fn document_timeout(&self) -> Duration {
        Duration::from_secs(self.document_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.document_concurrency == 0 {
            return Err(Error::Config(
                "analysis.document_concurrency must be at least 1".to_string(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::Config(
                "analysis.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if self.document_timeout_secs == 0 {
            return Err(Error::Config(
                "analysis.document_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5790
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ihale.db")
}

fn default_backend_url() -> String {
    "http://127.0.0.1:5791/extract".to_string()
}

fn default_document_timeout_secs() -> u64 {
    600
}

fn default_document_concurrency() -> usize {
    1
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    15
}

fn default_skip_extensions() -> Vec<String> {
    vec!["zip".to_string(), "rar".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Command-line configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub backend_url: Option<String>,
}

/// Locate the config file: explicit path, then `IHALE_CONFIG`, then the
/// per-user config directory. Returns `None` when no file exists.
pub fn locate_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|d| d.join("ihale").join("ihale.toml"))
        .filter(|p| p.exists())
}

/// Read and parse a TOML config file
pub fn read_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse TOML {:?}: {}", path, e)))
}

/// Resolve the effective configuration
pub fn load_config(overrides: &ConfigOverrides) -> Result<TomlConfig> {
    let mut config = match locate_config_file(overrides.config_path.as_deref()) {
        Some(path) => {
            let config = read_toml_config(&path)?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        None => {
            debug!("No config file found, using defaults");
            TomlConfig::default()
        }
    };

    // Tier 2: environment
    if let Ok(port) = std::env::var(ENV_PORT) {
        config.port = port
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", ENV_PORT, e)))?;
    }
    if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
        config.database_path = PathBuf::from(path);
    }
    if let Ok(url) = std::env::var(ENV_BACKEND_URL) {
        config.analysis.backend_url = url;
    }

    // Tier 1: command line
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(path) = &overrides.database_path {
        config.database_path = path.clone();
    }
    if let Some(url) = &overrides.backend_url {
        config.analysis.backend_url = url.clone();
    }

    config.analysis.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.port, 5790);
        assert_eq!(config.analysis.document_concurrency, 1);
        assert_eq!(config.analysis.keepalive(), Duration::from_secs(15));
        assert_eq!(config.analysis.skip_extensions, vec!["zip", "rar"]);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            port = 6000
            [analysis]
            document_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.analysis.document_timeout(), Duration::from_secs(30));
        assert_eq!(config.analysis.subscriber_buffer, 256);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let analysis = AnalysisConfig {
            document_concurrency: 0,
            ..AnalysisConfig::default()
        };
        assert!(matches!(analysis.validate(), Err(Error::Config(_))));
    }
}
