use std::path::PathBuf;

use ratrix_core::{
    capture::open_camera,
    encoder::FfmpegEncoderFactory,
    settings::RuntimeParams,
    stop::StopSignal,
    transfer::ProcessTransferLauncher,
    worker::{prepare_directories, CameraWorker, SystemClock, EXIT_OPEN_FAILED, EXIT_SETUP_FAILED},
};
use tracing::{error, info, warn};

use crate::{commands::load_config, GlobalPaths};

/// Runs the capture loop for one camera and returns the process exit code.
#[tracing::instrument(skip_all, fields(slot = index))]
pub fn camera_handler(paths: &GlobalPaths, index: usize, stop_file: Option<PathBuf>) -> i32 {
    let config = match load_config(&paths.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return EXIT_SETUP_FAILED;
        },
    };
    let params = match RuntimeParams::resolve(&config, index) {
        Ok(params) => params,
        Err(err) => {
            error!("{err}");
            return EXIT_SETUP_FAILED;
        },
    };

    let stop = stop_file.map_or_else(StopSignal::local, StopSignal::attach);
    let handler_stop = stop.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        if handler_stop.set() {
            info!("interrupt received, finishing the current segment");
        }
    }) {
        warn!("interrupt handler not installed: {err}");
    }

    if let Err(err) = prepare_directories(&params) {
        error!("{}: cannot prepare directories: {err}", params.label);
        return EXIT_SETUP_FAILED;
    }

    let camera = match open_camera(&params) {
        Ok(camera) => camera,
        Err(err) => {
            error!("{}: {err}", params.label);
            return EXIT_OPEN_FAILED;
        },
    };

    let program = match std::env::current_exe() {
        Ok(program) => program,
        Err(err) => {
            error!("cannot locate the ratrix executable for transfers: {err}");
            return EXIT_SETUP_FAILED;
        },
    };
    let launcher = ProcessTransferLauncher::new(program, paths.child_args());
    let encoders = FfmpegEncoderFactory::new(&config.video);

    let worker = CameraWorker::new(params, camera, encoders, launcher, SystemClock, stop);
    let report = worker.run();
    info!(
        "{}: {} frames in {} segment(s), {} dropped, {} transfer(s) started",
        report.exit,
        report.frames_captured,
        report.segments.len(),
        report.frames_dropped,
        report.transfers.launched
    );
    report.exit.code()
}
