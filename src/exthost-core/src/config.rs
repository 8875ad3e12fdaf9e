use crate::paths::AppDirs;
use crate::DEFAULT_EXTENSION_CONTRACT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Largest chunk payload a frame header can describe.
pub const MAX_BUFFER_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            extensions: ExtensionsConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_console_enabled")]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: default_console_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Where packages are discovered and which contract they must declare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    #[serde(default = "default_contract")]
    pub contract: String,
    /// Defaults to `<data_dir>/extensions` when unset.
    #[serde(default)]
    pub packages_dir: Option<PathBuf>,
    #[serde(default = "default_watch_enabled")]
    pub watch: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            contract: default_contract(),
            packages_dir: None,
            watch: default_watch_enabled(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ExtensionsConfig {
    pub fn packages_dir(&self, dirs: &AppDirs) -> PathBuf {
        self.packages_dir
            .clone()
            .unwrap_or_else(|| dirs.extensions_dir().to_path_buf())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Transport constants. These are local configuration points, never negotiated with the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Defaults to `<data_dir>/run` when unset.
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            call_timeout_secs: default_call_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            socket_dir: None,
        }
    }
}

impl IpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn socket_dir(&self, dirs: &AppDirs) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| dirs.runtime_dir().to_path_buf())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("ipc.buffer_size must be between 1 and {max}, got {found}")]
    BufferSize { found: usize, max: usize },
    #[error("ipc.{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
    #[error("ipc.max_message_bytes ({found}) is smaller than ipc.buffer_size ({buffer_size})")]
    MessageLimit { found: usize, buffer_size: usize },
    #[error("extensions.contract must not be empty")]
    EmptyContract,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.extensions.contract.trim().is_empty() {
            return Err(ValidationError::EmptyContract);
        }

        let ipc = &self.ipc;
        if ipc.buffer_size == 0 || ipc.buffer_size > MAX_BUFFER_SIZE {
            return Err(ValidationError::BufferSize {
                found: ipc.buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        if ipc.call_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "call_timeout_secs",
            });
        }
        if ipc.open_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "open_timeout_secs",
            });
        }
        if ipc.max_message_bytes < ipc.buffer_size {
            return Err(ValidationError::MessageLimit {
                found: ipc.max_message_bytes,
                buffer_size: ipc.buffer_size,
            });
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_console_enabled() -> bool {
    false
}

fn default_contract() -> String {
    DEFAULT_EXTENSION_CONTRACT.to_string()
}

fn default_watch_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_buffer_size() -> usize {
    2048
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_open_timeout_secs() -> u64 {
    5
}

fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}
