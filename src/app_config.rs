//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file and overridden on the command
//! line.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use shell_fs::fs::shell_fs::{DEFAULT_INPUT_VAR, ShellFsConfig};
use thiserror::Error;
use tracing::debug;

fn shell_fs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("shell-fs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("shell-fs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    shell_fs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/shell-fs.pid"),
        |rd| rd.join("shell-fs.pid"),
    )
}

fn default_mount_point() -> PathBuf {
    shell_fs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/shell-fs/mnt"), |rd| rd.join("mnt"))
}

fn default_shell() -> String {
    "sh".to_owned()
}

fn default_input_var() -> String {
    DEFAULT_INPUT_VAR.to_owned()
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// Freshness windows and the memory bound of the caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// How long a listing is served before the list command runs again.
    pub listing_ttl_ms: u64,

    /// How long materialized content is served before the transform runs again.
    pub content_ttl_ms: u64,

    /// How long a failed command is remembered before it is retried.
    pub failure_ttl_ms: u64,

    /// The maximum total size of cached content. Unbounded if absent.
    pub max_size: Option<ByteSize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listing_ttl_ms: 1000,
            content_ttl_ms: 60_000,
            failure_ttl_ms: 5000,
            max_size: None,
        }
    }
}

/// Where the daemon writes its logs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonLogConfig {
    /// Log file path. Logs are discarded if absent.
    pub target: Option<PathBuf>,

    /// Emit ANSI colours into the log file.
    pub color: bool,
}

impl DaemonLogConfig {
    /// Open (creating if needed) the log file in append mode.
    pub fn open_log_file(&self) -> Result<Option<File>, std::io::Error> {
        let Some(path) = &self.target else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
    }

    /// Whether the detached process should colour its output.
    #[must_use]
    pub fn should_use_color(&self) -> bool {
        self.color
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon. Uses /var/run/shell-fs.pid if not specified.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Logging of the detached process.
    #[serde(default)]
    pub log: DaemonLogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log: DaemonLogConfig::default(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Command whose stdout lists the files, one per line.
    #[serde(default)]
    pub list_command: String,

    /// Command whose stdout is the content of the file named by `input-var`.
    #[serde(default)]
    pub transform_command: String,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Upper bound on every command invocation. Unbounded if absent.
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,

    /// Interpreter used as `<shell> -c <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variable carrying the filename into the transform command.
    #[serde(default = "default_input_var")]
    pub input_var: String,

    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The user owning every file. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group owning every file. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_command: String::new(),
            transform_command: String::new(),
            mount_point: default_mount_point(),
            cache: CacheConfig::default(),
            command_timeout_ms: None,
            shell: default_shell(),
            input_var: default_input_var(),
            daemon: DaemonConfig::default(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.list_command.trim().is_empty() {
            errors.push("No list command given (`list-command` or --list).".to_owned());
        }

        if self.transform_command.trim().is_empty() {
            errors.push("No transform command given (`transform-command` or --transform).".to_owned());
        }

        if self.shell.is_empty() {
            errors.push("`shell` must not be empty.".to_owned());
        }

        if self.input_var.is_empty() || self.input_var.contains(['=', '\0']) {
            errors.push(format!(
                "`input-var` '{}' is not a valid environment variable name.",
                self.input_var
            ));
        }

        if self.command_timeout_ms == Some(0) {
            errors.push("`command-timeout-ms` must be greater than zero.".to_owned());
        }

        if self.cache.listing_ttl_ms == 0 {
            errors.push("`cache.listing-ttl-ms` must be greater than zero.".to_owned());
        }

        if self.cache.content_ttl_ms == 0 {
            errors.push("`cache.content-ttl-ms` must be greater than zero.".to_owned());
        }

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The library-facing view of this configuration.
    pub fn to_shell_fs_config(&self) -> ShellFsConfig {
        ShellFsConfig {
            listing_freshness: Duration::from_millis(self.cache.listing_ttl_ms),
            content_freshness: Duration::from_millis(self.cache.content_ttl_ms),
            failure_window: Duration::from_millis(self.cache.failure_ttl_ms),
            input_var: self.input_var.clone(),
            max_content_bytes: self.cache.max_size.map(|s| s.as_u64()),
            uid: self.uid,
            gid: self.gid,
            ..ShellFsConfig::new(self.list_command.clone(), self.transform_command.clone())
        }
    }

    /// The uniform bound on command invocations.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("shell-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("shell-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/shell-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, otherwise from the first config file
    /// found on the search path. Falls back to defaults if there is none.
    ///
    /// Errors if a config file exists but is malformed. Validation is left to the caller, since
    /// command line overrides may still fill in missing values.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}
