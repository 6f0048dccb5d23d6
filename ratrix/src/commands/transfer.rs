use std::path::{Path, PathBuf};

use ratrix_core::transfer::{TransferJob, Transferer};
use tracing::{error, warn};

use crate::commands::load_config;

/// Moves one segment and returns the process exit code.
pub fn transfer_handler(config_path: &Path, source: PathBuf, destination: PathBuf) -> i32 {
    // An interrupt sent to the whole process group must not abort a copy in flight.
    if let Err(err) = ctrlc::set_handler(|| warn!("interrupt ignored while the transfer is running")) {
        warn!("interrupt handler not installed: {err}");
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return 1;
        },
    };

    let job = TransferJob {
        source,
        destination,
    };
    match Transferer::from_config(&config).run(&job) {
        Ok(_) => 0,
        Err(err) => {
            error!("{err}");
            1
        },
    }
}
