//! Frame acquisition from capture devices.

use std::path::PathBuf;

use thiserror::Error;

use crate::settings::RuntimeParams;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod v4l2;
        pub use v4l2::{list_devices, V4lCamera};
    }
}

/// One captured frame, packed RGB24 in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width:  u32,
    pub height: u32,
    pub data:   Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CaptureError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(CaptureError::Decode(format!(
                "{width}x{height} frame needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A uniformly coloured frame.
    #[inline]
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb.iter().copied().cycle().take(rgb_len(width, height)).collect();
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.data.get(offset..offset + 3).map(|p| [p[0], p[1], p[2]])
    }
}

#[inline]
fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// A camera that has been opened successfully.
pub trait FrameSource {
    /// Blocks until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Returns a frame that is already queued in the device, without waiting for a new
    /// exposure. Used while draining on shutdown.
    fn read_buffered(&mut self) -> Option<Frame> {
        None
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    #[inline]
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).read_frame()
    }

    #[inline]
    fn read_buffered(&mut self) -> Option<Frame> {
        (**self).read_buffered()
    }
}

/// Counts attached capture devices for the supervisor's availability gate.
pub trait DeviceProbe {
    fn count_devices(&self) -> Result<usize, CaptureError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub name:  String,
    pub path:  PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDeviceProbe;

impl DeviceProbe for SystemDeviceProbe {
    #[inline]
    fn count_devices(&self) -> Result<usize, CaptureError> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(list_devices()?.len())
            } else {
                Err(CaptureError::Unsupported)
            }
        }
    }
}

/// Opens the device described by `params` with its resolution, frame rate and exposure.
#[inline]
pub fn open_camera(params: &RuntimeParams) -> Result<Box<dyn FrameSource>, CaptureError> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Ok(Box::new(V4lCamera::open(params)?))
        } else {
            let _ = params;
            Err(CaptureError::Unsupported)
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture device {device} could not be opened: {source}")]
    Open {
        device: u32,
        source: std::io::Error,
    },
    #[error("Capture device {device} does not support {width}x{height}: {reason}")]
    UnsupportedMode {
        device: u32,
        width:  u32,
        height: u32,
        reason: String,
    },
    #[error("Frame read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("Frame could not be decoded: {0}")]
    Decode(String),
    #[error("Failed to enumerate capture devices: {0}")]
    Enumerate(#[source] std::io::Error),
    #[error("Camera capture is not supported on this platform")]
    Unsupported,
}
