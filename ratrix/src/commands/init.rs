use std::path::Path;

use anyhow::{bail, Result};
use ratrix_core::{preview, settings::RecorderConfig};
use tracing::{error, info, warn};

use crate::RatrixCliError;

/// Writes a starting config with storage beside the config file.
pub fn init_handler(config_path: &Path, rack: &str, cameras: u32, force: bool) -> Result<()> {
    if config_path.exists() {
        if !force {
            let err = RatrixCliError::ConfigFileAlreadyExists(config_path.to_path_buf());
            error!("{}", err);
            bail!(err);
        }
        warn!("overwriting {}", config_path.display());
    }

    let root = config_path.parent().map_or_else(std::env::current_dir, |dir| Ok(dir.to_path_buf()))?;
    let root = path_abs::PathAbs::new(root)?.as_path().to_path_buf();
    let configuration = RecorderConfig::with_cameras(rack, cameras, &root);
    configuration.validate()?;
    configuration.save(config_path)?;

    if preview::ensure_placeholder(&configuration.paths.offline_image)? {
        info!("Wrote offline placeholder to {}", configuration.paths.offline_image.display());
    }
    info!("Initialized ratrix configuration at: {}", config_path.display());
    info!("Edit the camera list if needed, then run \"ratrix run\" to start recording.");

    Ok(())
}
