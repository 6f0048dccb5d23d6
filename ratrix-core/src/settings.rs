use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SLICE_SECONDS: u64 = 3600;
pub const DEFAULT_PREVIEW_INTERVAL_SECONDS: u32 = 5;
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Rack-wide recording configuration, loaded once per process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub rack_name:   String,
    pub study_label: String,
    pub defaults:    CaptureDefaults,
    pub cameras:     Vec<CameraConfig>,

    /// Wall-clock length of one segment.
    pub slice_seconds:            u64,
    /// Seconds of video between two preview exports.
    pub preview_interval_seconds: u32,

    pub video:      VideoSettings,
    pub paths:      StoragePaths,
    pub transfer:   TransferSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureDefaults {
    pub width:         u32,
    pub height:        u32,
    pub fps:           u32,
    #[serde(default)]
    pub exposure:      Option<i32>,
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
}

/// One physical camera. Unset overrides fall back to [`CaptureDefaults`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device index, `/dev/video{device}`.
    pub device:   u32,
    pub name:     String,
    pub row:      u32,
    pub column:   u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width:    Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height:   Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps:      Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub ffmpeg:     PathBuf,
    /// ffmpeg encoder used while recording, e.g. `mpeg4` or `libx264`.
    pub codec:      String,
    /// Container extension including the leading dot.
    pub extension:  String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePaths {
    pub temp_root:     PathBuf,
    pub save_root:     PathBuf,
    pub stills_root:   PathBuf,
    pub offline_image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TransferMode {
    Copy,
    Transcode { encoder: String, preset: String, crf: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    pub mode:                TransferMode,
    pub retry_delay_seconds: u64,
    /// `None` retries until the transfer succeeds.
    #[serde(default)]
    pub max_attempts:        Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub poll_interval_ms:         u64,
    pub spawn_stagger_ms:         u64,
    #[serde(default)]
    pub require_all_devices:      bool,
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub inhibit_sleep:            bool,
}

const fn default_read_attempts() -> u32 {
    DEFAULT_READ_ATTEMPTS
}

const fn default_true() -> bool {
    true
}

impl Default for CaptureDefaults {
    #[inline]
    fn default() -> Self {
        Self {
            width:         1280,
            height:        720,
            fps:           30,
            exposure:      None,
            read_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }
}

impl Default for VideoSettings {
    #[inline]
    fn default() -> Self {
        Self {
            ffmpeg:     PathBuf::from("ffmpeg"),
            codec:      "mpeg4".to_owned(),
            extension:  ".mp4".to_owned(),
            extra_args: vec!["-q:v".to_owned(), "4".to_owned()],
        }
    }
}

impl Default for TransferSettings {
    #[inline]
    fn default() -> Self {
        Self {
            mode:                TransferMode::Copy,
            retry_delay_seconds: 5,
            max_attempts:        None,
        }
    }
}

impl Default for SupervisorSettings {
    #[inline]
    fn default() -> Self {
        Self {
            poll_interval_ms:         1000,
            spawn_stagger_ms:         500,
            require_all_devices:      false,
            shutdown_timeout_seconds: 300,
            inhibit_sleep:            true,
        }
    }
}

impl TransferSettings {
    #[inline]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl SupervisorSettings {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn spawn_stagger(&self) -> Duration {
        Duration::from_millis(self.spawn_stagger_ms)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl RecorderConfig {
    /// A starting configuration for a rack of `cameras` devices laid out two per row.
    #[inline]
    pub fn with_cameras(rack_name: &str, cameras: u32, root: &Path) -> Self {
        let cameras = (0..cameras)
            .map(|device| CameraConfig {
                device,
                name: format!("cam{:02}", device + 1),
                row: device / 2,
                column: device % 2,
                width: None,
                height: None,
                fps: None,
                exposure: None,
            })
            .collect();

        Self {
            rack_name: rack_name.to_owned(),
            study_label: "study".to_owned(),
            defaults: CaptureDefaults::default(),
            cameras,
            slice_seconds: DEFAULT_SLICE_SECONDS,
            preview_interval_seconds: DEFAULT_PREVIEW_INTERVAL_SECONDS,
            video: VideoSettings::default(),
            paths: StoragePaths {
                temp_root:     root.join("temp"),
                save_root:     root.join("videos"),
                stills_root:   root.join("stills"),
                offline_image: root.join("offline.png"),
            },
            transfer: TransferSettings::default(),
            supervisor: SupervisorSettings::default(),
        }
    }

    #[inline]
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut buffer = vec![];
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer).map_err(ConfigError::Serialize)?;
        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory).map_err(ConfigError::Save)?;
        }
        std::fs::write(path, buffer).map_err(ConfigError::Save)?;
        Ok(())
    }

    /// Returns `Ok(None)` when no file exists at `path`.
    #[inline]
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Some(config))
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::Invalid("no cameras configured".to_owned()));
        }
        if self.slice_seconds == 0 {
            return Err(ConfigError::Invalid("slice_seconds must be positive".to_owned()));
        }
        if self.preview_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "preview_interval_seconds must be positive".to_owned(),
            ));
        }
        if self.defaults.read_attempts == 0 {
            return Err(ConfigError::Invalid("read_attempts must be at least 1".to_owned()));
        }

        let mut names = HashSet::new();
        for index in 0..self.cameras.len() {
            let params = RuntimeParams::resolve(self, index)?;
            if params.fps == 0 {
                return Err(ConfigError::Invalid(format!("{}: fps must be positive", params.name)));
            }
            if params.width % 2 != 0 || params.height % 2 != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: resolution {}x{} must be even",
                    params.name, params.width, params.height
                )));
            }
            if !names.insert(params.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "camera name {} is used twice",
                    params.name
                )));
            }
        }

        Ok(())
    }
}

/// Effective settings for one camera worker, resolved once at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Position of the camera in the configured list.
    pub slot:          usize,
    pub device:        u32,
    pub name:          String,
    /// `{study_label}_{camera_name}`, stamped on frames and used in file names.
    pub label:         String,
    pub width:         u32,
    pub height:        u32,
    pub fps:           u32,
    pub exposure:      Option<i32>,
    pub read_attempts: u32,

    pub slice:         Duration,
    /// Number of captured frames between two preview exports.
    pub preview_every: u64,
    pub extension:     String,

    pub temp_dir:     PathBuf,
    pub save_root:    PathBuf,
    pub preview_path: PathBuf,
}

impl RuntimeParams {
    #[inline]
    pub fn resolve(config: &RecorderConfig, slot: usize) -> Result<Self, ConfigError> {
        let camera = config.cameras.get(slot).ok_or(ConfigError::UnknownCamera {
            slot,
            configured: config.cameras.len(),
        })?;
        let defaults = &config.defaults;
        let fps = camera.fps.unwrap_or(defaults.fps);

        Ok(Self {
            slot,
            device: camera.device,
            name: camera.name.clone(),
            label: format!("{}_{}", config.study_label, camera.name),
            width: camera.width.unwrap_or(defaults.width),
            height: camera.height.unwrap_or(defaults.height),
            fps,
            exposure: camera.exposure.or(defaults.exposure),
            read_attempts: defaults.read_attempts.max(1),
            slice: Duration::from_secs(config.slice_seconds),
            preview_every: (u64::from(config.preview_interval_seconds) * u64::from(fps)).max(1),
            extension: config.video.extension.clone(),
            temp_dir: camera_temp_dir(&config.paths.temp_root, slot),
            save_root: config.paths.save_root.clone(),
            preview_path: crate::preview::preview_path(&config.paths.stills_root, &camera.name),
        })
    }
}

/// `{temp_root}/{NN}` with a one-based, two-digit slot number.
#[inline]
pub fn camera_temp_dir(temp_root: &Path, slot: usize) -> PathBuf {
    temp_root.join(format!("{:02}", slot + 1))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config file {path}: {source}")]
    Load {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path:   PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize config file: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to save config file: {0}")]
    Save(#[from] std::io::Error),
    #[error("Camera slot {slot} is not configured ({configured} cameras)")]
    UnknownCamera { slot: usize, configured: usize },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecorderConfig {
        let mut config = RecorderConfig::with_cameras("rack1", 3, Path::new("/data"));
        config.study_label = "mice".to_owned();
        config.defaults.fps = 10;
        config.cameras[1].fps = Some(25);
        config.cameras[1].width = Some(640);
        config.cameras[1].height = Some(480);
        config.cameras[2].exposure = Some(150);
        config
    }

    #[test]
    fn resolve_applies_overrides_over_defaults() {
        let config = sample();

        let first = RuntimeParams::resolve(&config, 0).unwrap();
        assert_eq!(first.label, "mice_cam01");
        assert_eq!((first.width, first.height, first.fps), (1280, 720, 10));
        assert_eq!(first.preview_every, 50);
        assert_eq!(first.temp_dir, PathBuf::from("/data/temp/01"));
        assert_eq!(first.preview_path, PathBuf::from("/data/stills/cam01_status.png"));

        let second = RuntimeParams::resolve(&config, 1).unwrap();
        assert_eq!((second.width, second.height, second.fps), (640, 480, 25));
        assert_eq!(second.preview_every, 125);

        let third = RuntimeParams::resolve(&config, 2).unwrap();
        assert_eq!(third.exposure, Some(150));
        assert_eq!(third.slice, Duration::from_secs(DEFAULT_SLICE_SECONDS));
    }

    #[test]
    fn resolve_rejects_unknown_slot() {
        let config = sample();
        assert!(matches!(
            RuntimeParams::resolve(&config, 3),
            Err(ConfigError::UnknownCamera {
                slot:       3,
                configured: 3,
            })
        ));
    }

    #[test]
    fn validate_catches_duplicate_names_and_odd_sizes() {
        let mut config = sample();
        assert!(config.validate().is_ok());

        config.cameras[2].name = "cam01".to_owned();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = sample();
        config.cameras[0].width = Some(641);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = sample();
        config.cameras.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn save_then_load_preserves_transcode_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ratrix.json");
        let mut config = sample();
        config.transfer.mode = TransferMode::Transcode {
            encoder: "libx264".to_owned(),
            preset:  "veryfast".to_owned(),
            crf:     23,
        };
        config.transfer.max_attempts = Some(4);

        config.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"method\": \"transcode\""));

        let loaded = RecorderConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_is_none_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RecorderConfig::load(&dir.path().join("absent.json")).unwrap().is_none());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RecorderConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
