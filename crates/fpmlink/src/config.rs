use anyhow::{Context as _, Result};
use serde::Deserialize;
use slog::Level;
use std::env;
use std::error;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fixed by contract with the environment image.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/.bref/php-fpm.sock";
pub const DEFAULT_PID_FILE: &str = "/tmp/.bref/php-fpm.pid";
pub const DEFAULT_CONFIG_FILE: &str = "/opt/bref/etc/php-fpm.conf";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::Error,
            LogLevel::Warning => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl FromStr for LogLevel {
    type Err = StringError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(StringError(format!("unknown log level {value:?}"))),
        }
    }
}

#[derive(Debug)]
pub struct StringError(pub String);

impl Display for StringError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl error::Error for StringError {}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Unix socket the worker runtime listens on.
    pub socket_path: PathBuf,

    /// Pid file the worker runtime writes its master pid to.
    pub pid_file: PathBuf,

    /// Worker runtime configuration file.
    pub config_file: PathBuf,

    /// The script that handles every request (FastCGI `SCRIPT_FILENAME`).
    pub handler: PathBuf,

    /// Worker runtime binary; resolved through `PATH` when not absolute.
    pub worker_binary: PathBuf,

    /// Minimum log level to output.
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            handler: PathBuf::from("index.php"),
            worker_binary: PathBuf::from("php-fpm"),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Configuration as the platform image provides it: `_HANDLER` names the
    /// script, relative to `LAMBDA_TASK_ROOT`.
    pub fn from_env() -> Result<Self> {
        let handler = env::var("_HANDLER").context("_HANDLER is not set")?;
        let task_root = env::var("LAMBDA_TASK_ROOT").unwrap_or_else(|_| ".".to_string());
        let mut config = Config::default();
        config.handler = Path::new(&task_root).join(handler);
        if let Ok(config_file) = env::var("FPMLINK_FPM_CONFIG") {
            config.config_file = PathBuf::from(config_file);
        }
        if let Ok(level) = env::var("FPMLINK_LOG_LEVEL") {
            config.log_level = level
                .parse::<LogLevel>()
                .context("parsing FPMLINK_LOG_LEVEL")?;
        }
        Ok(config)
    }
}
