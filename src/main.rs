//! Mount the output of shell commands as a read-only directory.
//!
//! A list command names the files; a transform command produces each file's content on demand,
//! with the filename exported as `$INPUT`.
use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod term;
mod trc;

use crate::app_config::{Config, ConfigError};
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A read-only filesystem whose files are produced by shell commands."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a shell-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(short, long, help = "Directory to mount the filesystem on.")]
    mountpoint: Option<PathBuf>,

    #[arg(short, long, help = "Command printing one filename per line.")]
    list: Option<String>,

    #[arg(
        short,
        long,
        help = "Command printing the content of the file named by $INPUT."
    )]
    transform: Option<String>,

    #[arg(short, long, help = "Run the filesystem in the background.")]
    daemonize: bool,
}

impl Args {
    /// Command line values take precedence over the configuration file.
    fn apply_to(self, config: &mut Config) {
        if let Some(mount_point) = self.mountpoint {
            config.mount_point = mount_point;
        }
        if let Some(list) = self.list {
            config.list_command = list;
        }
        if let Some(transform) = self.transform {
            config.transform_command = transform;
        }
    }
}

fn load_config(args: Args) -> Result<Config, ConfigError> {
    let mut config = Config::load(args.config_path.as_deref())?;
    args.apply_to(&mut config);
    config.validate().map_err(ConfigError::ValidationErrors)?;
    Ok(config)
}

fn init_tracing(trc: Trc) {
    trc.init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });
}

fn run_daemonized(config: Config) -> Result<(), String> {
    // Safe: Config.validate() guarantees pid_file's parent exists.
    let pid_file_parent = config
        .daemon
        .pid_file
        .parent()
        .unwrap_or_else(|| unreachable!("Config.validate() ensures pid_file has a parent"));
    std::fs::create_dir_all(pid_file_parent)
        .map_err(|e| format!("Failed to create PID file directory: {e}"))?;

    let log_file = config
        .daemon
        .log
        .open_log_file()
        .map_err(|e| format!("Failed to open log file: {e}"))?;

    let mut daemonize = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);

    if let Some(file) = log_file {
        let clone = file
            .try_clone()
            .map_err(|e| format!("Failed to clone log file handle: {e}"))?;
        daemonize = daemonize.stdout(file).stderr(clone);
    }

    daemonize
        .start()
        .map_err(|e| format!("Failed to spawn the daemon: {e}"))?;

    // From here on stderr is the log file, if any.
    init_tracing(Trc::default().daemonized(config.daemon.log.should_use_color()));
    debug!(config = ?config, "Daemon started with configuration.");
    daemon::spawn(config).map_err(|e| format!("Daemon failed: {e}"))
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();
    let daemonize = args.daemonize;

    // Errors use eprintln since tracing isn't initialized yet.
    let config = load_config(args).unwrap_or_else(|e| {
        match e {
            ConfigError::ValidationErrors(error_messages) => {
                eprintln!("Configuration is invalid.");
                for msg in &error_messages {
                    eprintln!(" - {msg}");
                }
            }
            e @ (ConfigError::DeserializationError(_) | ConfigError::IoError(_)) => {
                eprintln!("Failed to load configuration: {e}");
            }
        }
        std::process::exit(1);
    });

    if daemonize {
        if let Err(e) = run_daemonized(config) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        return;
    }

    init_tracing(Trc::default());
    debug!(config = ?config, "Starting with configuration...");
    if let Err(e) = daemon::spawn(config) {
        error!("Daemon failed: {e}");
        std::process::exit(1);
    }
}
