//! TOML configuration for the sessionkeeper daemon and CLI.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration. The file path can be overridden with the
//! `SESSIONKEEPER_CONFIG` environment variable or the `--config` flag.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SESSIONKEEPER_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/sessionkeeper/sessionkeeper.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `$SESSIONKEEPER_CONFIG`, the system config file, then
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SESSIONKEEPER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; without one the usual search applies.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding sites and login history.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/sessionkeeper/sessionkeeper.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How late a job may still fire after its scheduled instant (seconds).
    /// Later jobs are skipped and the site gets a fresh schedule.
    pub misfire_grace_secs: u64,
    /// Capacity of the domain event channel.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_secs: 3600,
            event_buffer: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Give up looking for the login form after this long.
    pub discovery_timeout_secs: u64,
    pub discovery_interval_secs: u64,
    /// Give up waiting for the success URL after this long.
    pub success_timeout_secs: u64,
    pub success_poll_ms: u64,
    /// Pause after each fill or click.
    pub settle_ms: u64,
    /// Script `wait` commands longer than this are shortened.
    pub max_wait_ms: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 30,
            discovery_interval_secs: 5,
            success_timeout_secs: 30,
            success_poll_ms: 1000,
            settle_ms: crate::script::DEFAULT_SETTLE_MS,
            max_wait_ms: crate::script::DEFAULT_MAX_WAIT_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Base URL of a W3C WebDriver server (geckodriver, chromedriver).
    pub webdriver_url: String,
    /// `firefox` or `chrome`.
    pub browser: String,
    pub headless: bool,
    /// Where screenshots are written as `<id>.png`.
    pub screenshot_dir: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:4444".to_string(),
            browser: "firefox".to_string(),
            headless: true,
            screenshot_dir: PathBuf::from("/var/lib/sessionkeeper/screenshots"),
            request_timeout_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/sessionkeeper/sessionkeeper.db"));
        assert_eq!(cfg.scheduler.misfire_grace_secs, 3600);
        assert_eq!(cfg.login.discovery_timeout_secs, 30);
        assert_eq!(cfg.login.discovery_interval_secs, 5);
        assert_eq!(cfg.login.success_timeout_secs, 30);
        assert_eq!(cfg.login.success_poll_ms, 1000);
        assert_eq!(cfg.login.settle_ms, 500);
        assert_eq!(cfg.login.max_wait_ms, 60_000);
        assert_eq!(cfg.driver.browser, "firefox");
        assert!(cfg.driver.headless);
        assert_eq!(cfg.api.bind, "127.0.0.1:8080");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
db_path = "/tmp/sk.db"

[scheduler]
misfire_grace_secs = 600

[login]
discovery_timeout_secs = 10
settle_ms = 250
max_wait_ms = 5000

[driver]
webdriver_url = "http://selenium:4444/wd/hub"
browser = "chrome"
headless = false

[api]
bind = "0.0.0.0:9000"

[logging]
level = "debug"
format = "json"
"#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/sk.db"));
        assert_eq!(cfg.scheduler.misfire_grace_secs, 600);
        assert_eq!(cfg.scheduler.event_buffer, 1024);
        assert_eq!(cfg.login.discovery_timeout_secs, 10);
        assert_eq!(cfg.login.discovery_interval_secs, 5);
        assert_eq!(cfg.login.settle_ms, 250);
        assert_eq!(cfg.login.max_wait_ms, 5000);
        assert_eq!(cfg.driver.webdriver_url, "http://selenium:4444/wd/hub");
        assert_eq!(cfg.driver.browser, "chrome");
        assert!(!cfg.driver.headless);
        assert_eq!(cfg.api.bind, "0.0.0.0:9000");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        let defaults = AppConfig::default();
        assert_eq!(cfg.storage.db_path, defaults.storage.db_path);
        assert_eq!(cfg.login.success_poll_ms, defaults.login.success_poll_ms);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sessionkeeper.toml");
        std::fs::write(&path, "[api]\nbind = \"0.0.0.0:9999\"\n").unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.api.bind, "0.0.0.0:9999");
        assert_eq!(AppConfig::resolve(Some(&path)).unwrap().api.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        assert!(AppConfig::load(Path::new("/nonexistent/sessionkeeper.toml")).is_err());
        assert!(AppConfig::resolve(Some(Path::new("/nonexistent/sessionkeeper.toml"))).is_err());
    }

    #[test]
    fn test_bad_value_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[logging]\nformat = \"xml\"\n").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = AppConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.driver.webdriver_url, cfg.driver.webdriver_url);
        assert_eq!(back.scheduler.misfire_grace_secs, cfg.scheduler.misfire_grace_secs);
    }
}
