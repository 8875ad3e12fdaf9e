pub mod config;
pub mod logging;
pub mod paths;

pub use config::{
    Config, ConfigError, ExtensionsConfig, IpcConfig, LogLevel, LoggingConfig, ValidationError,
    MAX_BUFFER_SIZE,
};
pub use logging::{init_logging, init_stderr_logging, LoggingError, LoggingGuard, LOG_ENV};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "exthost";
pub const APP_AUTHOR: &str = "Exthost";
pub const APP_QUALIFIER: &str = "io";

/// Contract name a package manifest must declare to be picked up by the manager.
pub const DEFAULT_EXTENSION_CONTRACT: &str = "exthost.tool";
