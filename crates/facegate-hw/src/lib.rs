//! facegate-hw: Hardware abstraction for the access-control terminal.
//!
//! Provides V4L2-based camera capture and a two-line character display
//! driven over I²C.

pub mod camera;
pub mod display;
pub mod frame;
pub mod lcd;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use display::{CharDisplay, DisplayError, TracingDisplay};
pub use frame::{Frame, FrameError};
pub use lcd::Lcd1602;
