use std::time::Instant;

use anyhow::{bail, Context, Result};
use ratrix_core::{
    capture::SystemDeviceProbe,
    encoder::locate_ffmpeg,
    recovery::{prepare_storage, recover_stray_segments},
    sleep_guard::SleepInhibitor,
    stop::StopSignal,
    supervisor::{stop_marker_path, ProcessWorkerLauncher, SysinfoTracker, Supervisor},
    transfer::{ThreadTransferLauncher, TransferPool, Transferer},
};
use tracing::{debug, error, info, warn};

use crate::{commands::load_config, GlobalPaths, RatrixCliError};

/// Exit status used when a second interrupt aborts the graceful shutdown.
const EXIT_INTERRUPTED: i32 = 130;

#[tracing::instrument(skip_all)]
pub fn run_handler(paths: &GlobalPaths) -> Result<()> {
    let config = load_config(&paths.config)?;
    match locate_ffmpeg(&config.video) {
        Ok(ffmpeg) => debug!("using {}", ffmpeg.display()),
        Err(_) => {
            let err = RatrixCliError::FfmpegNotFound(config.video.ffmpeg.clone());
            error!("{}", err);
            bail!(err);
        },
    }

    prepare_storage(&config)?;
    let marker = stop_marker_path(&config.paths.temp_root);
    let stop = StopSignal::create(&marker)
        .with_context(|| format!("Failed to reset stop marker {}", marker.display()))?;

    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.set() {
            info!("Stopping all cameras, press Ctrl+C again to abort");
        } else {
            warn!("Second interrupt, exiting without waiting for workers");
            std::process::exit(EXIT_INTERRUPTED);
        }
    })?;

    let _inhibitor = if config.supervisor.inhibit_sleep {
        match SleepInhibitor::acquire("ratrix", &format!("recording rack {}", config.rack_name)) {
            Ok(inhibitor) => Some(inhibitor),
            Err(err) => {
                warn!("Host sleep is not inhibited: {err:#}");
                None
            },
        }
    } else {
        None
    };

    let mut recovery = TransferPool::new(ThreadTransferLauncher::new(Transferer::from_config(&config)));
    recover_stray_segments(&config, &mut recovery);

    let program = std::env::current_exe().context("Failed to locate the ratrix executable")?;
    let launcher = ProcessWorkerLauncher::new(program, paths.child_args(), &marker);
    let mut supervisor = Supervisor::new(
        &config,
        launcher,
        SystemDeviceProbe,
        SysinfoTracker::default(),
        stop,
    );

    info!(
        "Recording rack {} ({} cameras, {}s segments)",
        config.rack_name,
        config.cameras.len(),
        config.slice_seconds
    );
    supervisor.run();

    let timeout = config.supervisor.shutdown_timeout();
    let deadline = Instant::now() + timeout;
    let report = supervisor.shutdown(timeout);
    if report.is_clean() {
        info!("All {} worker(s) stopped cleanly", report.workers_exited);
    } else {
        warn!(
            "Shutdown forced: {} worker(s) and {} helper process(es) killed",
            report.workers_killed, report.descendants_killed
        );
    }

    let remaining = recovery.join_until(deadline);
    if remaining > 0 {
        warn!("{remaining} recovered segment(s) still in transfer, they will be retried next run");
    }
    info!("Recording finished");

    Ok(())
}
