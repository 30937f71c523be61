//! Camera frame source over V4L2 memory-mapped streaming.

use crate::frame::{self, Frame, FrameError};
use std::io;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Resolution asked of the driver; it may hand back something else.
const PREFERRED_SIZE: (u32, u32) = (640, 480);
const BUFFER_COUNT: u32 = 4;
/// Highest `/dev/videoN` checked by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("camera {0} is in use by another process")]
    Busy(String),
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("{0} cannot capture video")]
    NotCaptureDevice(String),
    #[error("format setup failed: {0}")]
    Format(String),
    #[error("stream error: {0}")]
    Stream(io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
}

impl CameraError {
    fn from_io(path: &str, source: io::Error) -> Self {
        if source.raw_os_error() == Some(libc::EBUSY) {
            CameraError::Busy(path.to_string())
        } else {
            CameraError::Open {
                path: path.to_string(),
                source,
            }
        }
    }
}

/// Anything that can hand out grayscale frames one at a time.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// A capture-capable node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Buffer layouts we know how to reduce to 8-bit luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, luma on every even byte.
    Yuyv,
    Grey,
    /// Little-endian 16-bit luma.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// Open camera with a running stream.
///
/// Streaming starts in [`Camera::open`] and stops when the value is
/// dropped, which also closes the device node.
pub struct Camera {
    stream: MmapStream<'static>,
    _device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path`, negotiate a luma-bearing format and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }

        let device =
            Device::with_path(device_path).map_err(|e| CameraError::from_io(device_path, e))?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::from_io(device_path, e))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let (width, height, pixel_format) = negotiate(&device)?;
        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, BUFFER_COUNT)
            .map_err(|e| CameraError::from_io(device_path, e))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            _device: device,
            device_path: device_path.to_string(),
            width,
            height,
            pixel_format,
        })
    }

    /// Throw away `count` frames while exposure settles.
    pub fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        for _ in 0..count {
            self.stream.next().map_err(CameraError::Stream)?;
        }
        Ok(())
    }

    /// Scan `/dev/video0..15` for nodes that can capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|n| format!("/dev/video{n}"))
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Ask for YUYV at the preferred size and accept whatever luma format comes back.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::Format(format!("reading current format: {e}")))?;
    wanted.width = PREFERRED_SIZE.0;
    wanted.height = PREFERRED_SIZE.1;
    wanted.fourcc = FourCC::new(b"YUYV");

    let got = device.set_format(&wanted).map_err(|e| {
        CameraError::Format(format!("applying {}x{} YUYV: {e}", wanted.width, wanted.height))
    })?;
    let pixel_format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CameraError::Format(format!("driver chose unsupported {:?}", got.fourcc))
    })?;
    Ok((got.width, got.height, pixel_format))
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(CameraError::Stream)?;
        let data = self.pixel_format.to_luma(buf, self.width, self.height)?;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_to_luma_dispatches_by_format() {
        let yuyv = [10, 128, 20, 128];
        assert_eq!(PixelFormat::Yuyv.to_luma(&yuyv, 2, 1).unwrap(), vec![10, 20]);
        assert_eq!(PixelFormat::Grey.to_luma(&yuyv, 2, 1).unwrap(), vec![10, 128]);
        assert_eq!(PixelFormat::Y16.to_luma(&yuyv, 2, 1).unwrap(), vec![128, 128]);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/nonexistent-video-device").err().unwrap();
        assert!(matches!(err, CameraError::NotFound(_)));
    }

    #[test]
    fn test_busy_errno_maps_to_busy() {
        let err = CameraError::from_io("/dev/video0", io::Error::from_raw_os_error(libc::EBUSY));
        assert!(matches!(err, CameraError::Busy(_)));

        let err = CameraError::from_io("/dev/video0", io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(err, CameraError::Open { .. }));
    }
}
