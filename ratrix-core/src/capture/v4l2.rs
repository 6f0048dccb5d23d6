use std::{io::Cursor, path::PathBuf, time::Duration};

use image::ImageReader;
use tracing::{debug, info, warn};
use v4l::{
    buffer::Type,
    control::{Control, Value},
    io::{mmap::Stream, traits::CaptureStream},
    video::{capture::Parameters, Capture},
    Device,
    FourCC,
};

use super::{CaptureError, DeviceInfo, Frame};
use crate::settings::RuntimeParams;

const BUFFER_COUNT: u32 = 4;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const EXPOSURE_MANUAL: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Mjpeg,
    Yuyv,
    Grey,
}

/// A V4L2 camera streaming through memory-mapped buffers.
pub struct V4lCamera {
    stream:   Stream<'static>,
    device:   u32,
    width:    u32,
    height:   u32,
    layout:   PixelLayout,
    draining: bool,
}

impl V4lCamera {
    #[inline]
    pub fn open(params: &RuntimeParams) -> Result<Self, CaptureError> {
        let path = device_path(params.device);
        let device = Device::with_path(&path).map_err(|source| CaptureError::Open {
            device: params.device,
            source,
        })?;

        let (width, height, layout) = negotiate_format(&device, params)?;
        match device.set_params(&Parameters::with_fps(params.fps)) {
            Ok(applied) => debug!("{} frame interval {:?}", params.label, applied.interval),
            Err(err) => warn!("{}: could not set {} fps: {err}", params.label, params.fps),
        }
        if let Some(exposure) = params.exposure {
            apply_exposure(&device, exposure, &params.label);
        }

        // The mmap stream borrows the device for its whole life; a worker process owns
        // exactly one camera, so the device is leaked for a 'static stream.
        let device: &'static Device = Box::leak(Box::new(device));
        let stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT).map_err(
            |source| CaptureError::Open {
                device: params.device,
                source,
            },
        )?;

        info!(
            "{} opened {} at {width}x{height} ({layout:?})",
            params.label,
            path.display()
        );
        Ok(Self {
            stream,
            device: params.device,
            width,
            height,
            layout,
            draining: false,
        })
    }

    fn convert(&mut self, data: &[u8]) -> Result<Frame, CaptureError> {
        let expected_yuyv = self.width as usize * self.height as usize * 2;
        let rgb = match self.layout {
            PixelLayout::Yuyv if data.len() >= expected_yuyv => {
                yuyv_to_rgb(data, self.width, self.height)
            },
            PixelLayout::Yuyv => {
                // some UVC cameras report YUYV but deliver compressed payloads
                self.layout = PixelLayout::Mjpeg;
                mjpeg_to_rgb(data)?
            },
            PixelLayout::Grey => grey_to_rgb(data, self.width, self.height),
            PixelLayout::Mjpeg => mjpeg_to_rgb(data)?,
        };
        Frame::new(self.width, self.height, rgb)
    }
}

impl super::FrameSource for V4lCamera {
    #[inline]
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let data = {
            let (data, _meta) = self.stream.next().map_err(CaptureError::Read)?;
            data.to_vec()
        };
        self.convert(&data)
    }

    #[inline]
    fn read_buffered(&mut self) -> Option<Frame> {
        if !self.draining {
            self.stream.set_timeout(DRAIN_TIMEOUT);
            self.draining = true;
        }
        let data = match self.stream.next() {
            Ok((data, _meta)) => data.to_vec(),
            Err(err) => {
                debug!("device {} has no buffered frames left: {err}", self.device);
                return None;
            },
        };
        self.convert(&data).ok()
    }
}

fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{index}"))
}

fn negotiate_format(
    device: &Device,
    params: &RuntimeParams,
) -> Result<(u32, u32, PixelLayout), CaptureError> {
    let unsupported = |reason: String| CaptureError::UnsupportedMode {
        device: params.device,
        width: params.width,
        height: params.height,
        reason,
    };

    let mut format = device.format().map_err(|err| unsupported(err.to_string()))?;
    format.width = params.width;
    format.height = params.height;

    let candidates = [
        (FourCC::new(b"MJPG"), PixelLayout::Mjpeg),
        (FourCC::new(b"YUYV"), PixelLayout::Yuyv),
        (FourCC::new(b"GREY"), PixelLayout::Grey),
    ];
    for (fourcc, layout) in candidates {
        format.fourcc = fourcc;
        let Ok(applied) = device.set_format(&format) else {
            continue;
        };
        if applied.fourcc != fourcc {
            continue;
        }
        if applied.width != params.width || applied.height != params.height {
            return Err(unsupported(format!(
                "driver fell back to {}x{}",
                applied.width, applied.height
            )));
        }
        return Ok((applied.width, applied.height, layout));
    }

    Err(unsupported("no MJPG, YUYV or GREY format accepted".to_owned()))
}

fn apply_exposure(device: &Device, exposure: i32, label: &str) {
    let manual = Control {
        id:    CID_EXPOSURE_AUTO,
        value: Value::Integer(EXPOSURE_MANUAL),
    };
    let absolute = Control {
        id:    CID_EXPOSURE_ABSOLUTE,
        value: Value::Integer(i64::from(exposure)),
    };
    if let Err(err) = device.set_control(manual).and_then(|()| device.set_control(absolute)) {
        warn!("{label}: exposure {exposure} not applied: {err}");
    }
}

/// Lists `/dev/video*` nodes that advertise at least one capture format, which skips the
/// metadata nodes UVC drivers create next to every camera.
#[inline]
pub fn list_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev").map_err(CaptureError::Enumerate)? {
        let path = entry.map_err(CaptureError::Enumerate)?.path();
        let Some(index) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("video"))
            .and_then(|index| index.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        if device.enum_formats().map_or(true, |formats| formats.is_empty()) {
            continue;
        }
        let name = device.query_caps().map_or_else(|_| format!("Camera {index}"), |caps| caps.card);
        devices.push(DeviceInfo {
            index,
            name,
            path,
        });
    }

    devices.sort_by_key(|device| device.index);
    Ok(devices)
}

fn mjpeg_to_rgb(data: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let image = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|err| CaptureError::Decode(err.to_string()))?
        .decode()
        .map_err(|err| CaptureError::Decode(err.to_string()))?;
    Ok(image.to_rgb8().into_raw())
}

fn grey_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for &luma in data.iter().take(pixels) {
        rgb.extend_from_slice(&[luma, luma, luma]);
    }
    rgb.resize(pixels * 3, 0);
    rgb
}

/// BT.601 limited-range conversion, two pixels per YUYV macropixel.
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);

    for chunk in yuyv.chunks_exact(4).take(pixels / 2) {
        let d = f32::from(chunk[1]) - 128.0;
        let e = f32::from(chunk[3]) - 128.0;
        for luma in [chunk[0], chunk[2]] {
            let c = f32::from(luma) - 16.0;
            let r = 1.164f32.mul_add(c, 1.596 * e);
            let g = 1.164f32.mul_add(c, (-0.392f32).mul_add(d, -0.813 * e));
            let b = 1.164f32.mul_add(c, 2.017 * d);
            rgb.extend_from_slice(&[to_channel(r), to_channel(g), to_channel(b)]);
        }
    }
    rgb.resize(pixels * 3, 0);
    rgb
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_channel(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}
