use std::{panic, path::PathBuf, process};

use clap::Parser;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    commands::{
        camera::camera_handler,
        devices::devices_handler,
        init::init_handler,
        run::run_handler,
        transfer::transfer_handler,
        Commands,
        RatrixCli,
    },
    logging::init_logging,
};

mod commands;
mod logging;

pub const DEFAULT_CONFIG_PATH: &str = "./ratrix.json";
pub const DEFAULT_LOG_PATH: &str = "./logs";

fn main() -> anyhow::Result<()> {
    let orig_hook = panic::take_hook();
    // Catch panics in child threads
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(1);
    }));
    run()
}

fn run() -> anyhow::Result<()> {
    let cli = RatrixCli::parse();
    let cwd = std::env::current_dir()?;
    let config_path = path_abs::PathAbs::new(cli.config.unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_PATH)))?
        .as_path()
        .to_path_buf();
    let logs = path_abs::PathAbs::new(cli.logs.unwrap_or_else(|| cwd.join(DEFAULT_LOG_PATH)))?
        .as_path()
        .to_path_buf();

    let role = log_role(&cli.command);
    let log_guard = init_logging(LevelFilter::INFO, &logs, &role, LevelFilter::DEBUG)?;

    let paths = GlobalPaths {
        config: config_path,
        logs,
    };
    match cli.command {
        Commands::Init {
            cameras,
            rack,
            force,
        } => init_handler(&paths.config, &rack, cameras, force)?,
        Commands::Run => run_handler(&paths)?,
        Commands::Camera {
            index,
            stop_file,
        } => {
            let code = camera_handler(&paths, index, stop_file);
            drop(log_guard);
            process::exit(code);
        },
        Commands::Transfer {
            source,
            destination,
        } => {
            let code = transfer_handler(&paths.config, source, destination);
            drop(log_guard);
            process::exit(code);
        },
        Commands::Devices => devices_handler()?,
    }

    Ok(())
}

/// Log file prefix for the process running `command`.
///
/// Transfers run concurrently and are told apart by pid.
fn log_role(command: &Commands) -> String {
    match command {
        Commands::Run => "supervisor".to_owned(),
        Commands::Camera {
            index, ..
        } => format!("camera-{:02}", index + 1),
        Commands::Transfer {
            ..
        } => format!("transfer-{}", process::id()),
        Commands::Init {
            ..
        }
        | Commands::Devices => "ratrix".to_owned(),
    }
}

/// Absolute locations shared by every subcommand and passed on to child processes.
#[derive(Debug, Clone)]
pub struct GlobalPaths {
    pub config: PathBuf,
    pub logs:   PathBuf,
}

impl GlobalPaths {
    /// Arguments that make a re-invoked `ratrix` see the same config and log directory.
    pub fn child_args(&self) -> Vec<std::ffi::OsString> {
        vec![
            "--config".into(),
            self.config.clone().into_os_string(),
            "--logs".into(),
            self.logs.clone().into_os_string(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum RatrixCliError {
    #[error("Cannot initialize over an existing config file: {0}")]
    ConfigFileAlreadyExists(PathBuf),
    #[error("No config file found at: {0}. Run \"ratrix init\" to create one.")]
    ConfigFileNotFound(PathBuf),
    #[error("ffmpeg was not found at \"{0}\" or in PATH")]
    FfmpegNotFound(PathBuf),
}
