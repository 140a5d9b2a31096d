//! Bootstrap configuration
//!
//! Settings are read once at process start. Sources in priority order:
//!
//! 1. Command-line `--config <path>` (highest priority)
//! 2. `DOCKET_CONFIG` environment variable
//! 3. User config file (`~/.config/docket/docket.toml` on Linux)
//! 4. System config file (`/etc/docket/docket.toml`, Linux only)
//! 5. Built-in defaults
//!
//! `DOCKET_DATA_DIR` overrides `data_dir` from any source.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "DOCKET_CONFIG";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV_VAR: &str = "DOCKET_DATA_DIR";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Directory holding the databases and the staging root
    pub data_dir: PathBuf,

    /// HTTP server port
    pub port: u16,

    pub logging: LoggingConfig,
    pub stores: StoresConfig,
    pub broker: BrokerConfig,
    pub limits: LimitsConfig,
    pub scoring: ScoringConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
}

/// Database file names, relative to `data_dir` unless absolute
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub pending_db: PathBuf,
    pub archive_db: PathBuf,
    pub broker_db: PathBuf,
    /// Staging root for uploaded item payloads
    pub staging_dir: PathBuf,
    /// Upper bound on lock-retry time for a single store operation
    pub max_lock_wait_ms: u64,
}

/// Broker connection and delivery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Connection attempts at startup before giving up
    pub connect_attempts: u32,
    /// Delay between startup connection attempts
    pub connect_retry_secs: u64,
    /// Time a claimed message stays invisible before redelivery
    pub lease_secs: u64,
    /// Idle poll interval when a queue is empty
    pub poll_interval_ms: u64,
}

/// Submission validation limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_bytes: u64,
    /// Lowercase extensions including the dot
    pub allowed_extensions: Vec<String>,
    pub target_text_min_chars: usize,
    pub target_text_max_chars: usize,
}

/// Scoring stage settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// HTTP endpoint accepting `{target_text, document_text}` and returning a score card
    pub endpoint: String,
    /// Fixed delay between items when a job asks for rate limiting
    pub rate_limit_delay_secs: u64,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            port: 5780,
            logging: LoggingConfig::default(),
            stores: StoresConfig::default(),
            broker: BrokerConfig::default(),
            limits: LimitsConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            pending_db: PathBuf::from("pending.db"),
            archive_db: PathBuf::from("archive.db"),
            broker_db: PathBuf::from("broker.db"),
            staging_dir: PathBuf::from("staging"),
            max_lock_wait_ms: crate::retry::DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_retry_secs: 5,
            lease_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            allowed_extensions: vec![
                ".pdf".to_string(),
                ".docx".to_string(),
                ".txt".to_string(),
                ".md".to_string(),
            ],
            target_text_min_chars: 50,
            target_text_max_chars: 10_000,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8088/score".to_string(),
            rate_limit_delay_secs: 5,
        }
    }
}

impl TomlConfig {
    /// Resolve and load configuration following the priority order above
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);

        let explicit = cli_path.map(Path::to_path_buf).or(env_path);
        let mut config = match explicit {
            // An explicitly named file must exist
            Some(path) => Self::from_file(&path)?,
            None => match locate_config_file() {
                Some(path) => Self::from_file(&path)?,
                None => {
                    info!("No config file found, using built-in defaults");
                    Self::default()
                }
            },
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV_VAR) {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        if self.broker.connect_attempts == 0 {
            return Err(Error::Config("broker.connect_attempts must be at least 1".into()));
        }
        if self.limits.target_text_min_chars > self.limits.target_text_max_chars {
            return Err(Error::Config(
                "limits.target_text_min_chars exceeds target_text_max_chars".into(),
            ));
        }
        Ok(())
    }

    pub fn pending_db_path(&self) -> PathBuf {
        self.resolve(&self.stores.pending_db)
    }

    pub fn archive_db_path(&self) -> PathBuf {
        self.resolve(&self.stores.archive_db)
    }

    pub fn broker_db_path(&self) -> PathBuf {
        self.resolve(&self.stores.broker_db)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.resolve(&self.stores.staging_dir)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_secs(self.broker.connect_retry_secs)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Find the first config file that exists in the platform locations
fn locate_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("docket").join("docket.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/docket/docket.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("docket"))
        .unwrap_or_else(|| PathBuf::from("./docket_data"))
}
