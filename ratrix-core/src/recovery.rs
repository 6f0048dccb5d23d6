//! Startup duties of the supervisor: storage layout and segments left behind by an
//! earlier run.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    preview::{self, PreviewError},
    segment,
    settings::RecorderConfig,
    transfer::{TransferJob, TransferLauncher, TransferPool},
};

/// Creates the storage roots and the offline placeholder.
#[inline]
pub fn prepare_storage(config: &RecorderConfig) -> Result<(), StorageError> {
    let paths = &config.paths;
    for root in [&paths.temp_root, &paths.save_root, &paths.stills_root] {
        std::fs::create_dir_all(root).map_err(|source| StorageError::Directory {
            path: root.clone(),
            source,
        })?;
    }
    if preview::ensure_placeholder(&paths.offline_image)? {
        info!("wrote offline placeholder to {}", paths.offline_image.display());
    }
    Ok(())
}

/// Finds finished segments in every camera's temporary directory and resolves where
/// each one belongs.
///
/// Files that do not look like segments, including half-written `.part` files, are left
/// alone.
#[inline]
pub fn find_stray_segments(config: &RecorderConfig) -> Vec<TransferJob> {
    let temp_root = &config.paths.temp_root;
    let extension = config.video.extension.as_str();
    let Ok(entries) = std::fs::read_dir(temp_root) else {
        debug!("no temporary root at {}", temp_root.display());
        return Vec::new();
    };

    let mut camera_dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    camera_dirs.sort();

    let mut jobs = Vec::new();
    for dir in camera_dirs {
        let files = match std::fs::read_dir(&dir) {
            Ok(files) => files,
            Err(err) => {
                warn!("cannot scan {}: {err}", dir.display());
                continue;
            },
        };
        let mut files: Vec<PathBuf> = files
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for source in files {
            if let Some(job) = stray_job(&source, extension, &config.paths.save_root) {
                jobs.push(job);
            }
        }
    }
    jobs
}

fn stray_job(source: &Path, extension: &str, save_root: &Path) -> Option<TransferJob> {
    let name = source.file_name()?.to_str()?;
    if !name.ends_with(extension) {
        return None;
    }
    let Some((label, opened_at)) = segment::parse_segment_name(name, extension) else {
        warn!("leaving unrecognised file {} in place", source.display());
        return None;
    };
    Some(TransferJob {
        source:      source.to_path_buf(),
        destination: segment::day_directory(save_root, &label, opened_at.date()).join(name),
    })
}

/// Submits a transfer for every stray segment. Returns how many were submitted.
#[inline]
pub fn recover_stray_segments<L: TransferLauncher>(
    config: &RecorderConfig,
    pool: &mut TransferPool<L>,
) -> usize {
    let jobs = find_stray_segments(config);
    if jobs.is_empty() {
        return 0;
    }
    info!("recovering {} segment(s) from an earlier run", jobs.len());
    jobs.into_iter().filter(|job| pool.submit(job.clone())).count()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    Directory {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Placeholder(#[from] PreviewError),
}
