//! Still images shown by the monitoring front end, one per camera.

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;

use crate::{annotate, capture::Frame};

const PLACEHOLDER_SIZE: (u32, u32) = (640, 480);

/// `{stills_root}/{camera_name}_status.png`
#[inline]
pub fn preview_path(stills_root: &Path, camera_name: &str) -> PathBuf {
    stills_root.join(format!("{camera_name}_status.png"))
}

/// Writes a PNG next to `path` and renames it into place so readers never observe a
/// partially written image.
#[inline]
pub fn write_preview(frame: &Frame, path: &Path) -> Result<(), PreviewError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or(PreviewError::Dimensions(frame.width, frame.height))?;
    let temp = staging_path(path);
    image.save_with_format(&temp, ImageFormat::Png)?;
    std::fs::rename(&temp, path).map_err(|source| PreviewError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Replaces the preview with the offline placeholder image.
#[inline]
pub fn show_offline(placeholder: &Path, path: &Path) -> Result<(), PreviewError> {
    let temp = staging_path(path);
    std::fs::copy(placeholder, &temp).map_err(|source| PreviewError::Io {
        path: placeholder.to_path_buf(),
        source,
    })?;
    std::fs::rename(&temp, path).map_err(|source| PreviewError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates a default placeholder if none exists yet. Returns whether a file was written.
#[inline]
pub fn ensure_placeholder(path: &Path) -> Result<bool, PreviewError> {
    if path.is_file() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PreviewError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let (width, height) = PLACEHOLDER_SIZE;
    let mut frame = Frame::filled(width, height, [32, 32, 32]);
    annotate::centered(&mut frame, "CAMERA OFFLINE");
    write_preview(&frame, path)?;
    Ok(true)
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("preview");
    path.with_file_name(format!("{name}.tmp.png"))
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Frame buffer does not match {0}x{1}")]
    Dimensions(u32, u32),
    #[error("Failed to encode preview: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Preview I/O failed for {path}: {source}")]
    Io {
        path:   PathBuf,
        source: std::io::Error,
    },
}
