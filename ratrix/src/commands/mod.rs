use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser as ClapParser, Subcommand};
use ratrix_core::settings::RecorderConfig;
use tracing::{debug, error};

use crate::RatrixCliError;

pub mod camera;
pub mod devices;
pub mod init;
pub mod run;
pub mod transfer;

#[derive(ClapParser)]
#[command(
    name = "ratrix",
    about = "Unattended multi-camera recorder with supervised capture workers.",
    version
)]
pub struct RatrixCli {
    #[command(subcommand)]
    pub command: Commands,
    /// Location of the config file. Defaults to `./ratrix.json`.
    #[arg(long, global = true)]
    pub config:  Option<PathBuf>,
    /// Directory for log files. Defaults to `./logs`.
    #[arg(long, global = true)]
    pub logs:    Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starting configuration.
    Init {
        /// Number of cameras, numbered from /dev/video0.
        #[arg(long, default_value_t = 4)]
        cameras: u32,
        #[arg(long, default_value = "rack")]
        rack:    String,
        /// Overwrite an existing config file.
        #[arg(long)]
        force:   bool,
    },
    /// Record from every configured camera until interrupted.
    Run,
    /// Capture worker for a single camera (started by `run`).
    Camera {
        /// Position of the camera in the config file, starting at 0.
        #[arg(long)]
        index:     usize,
        /// Marker file whose appearance requests a stop.
        #[arg(long)]
        stop_file: Option<PathBuf>,
    },
    /// Move one finished segment to permanent storage (started by camera workers).
    Transfer {
        #[arg(long)]
        source:      PathBuf,
        #[arg(long)]
        destination: PathBuf,
    },
    /// List attached capture devices.
    Devices,
}

/// Loads and validates the config file, failing when it does not exist.
#[inline]
pub fn load_config(path: &Path) -> anyhow::Result<RecorderConfig> {
    let Some(config) = RecorderConfig::load(path)? else {
        let err = RatrixCliError::ConfigFileNotFound(path.to_path_buf());
        error!("{}", err);
        bail!(err);
    };
    config.validate()?;
    debug!("loaded {} camera(s) from {}", config.cameras.len(), path.display());
    Ok(config)
}
