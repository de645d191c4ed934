//! Camera capture module
//!
//! Provides the capture configuration value object, the live frame stream
//! shared by pose sampling and recording, and the camera backends
//! (a synthetic test-pattern source everywhere, nokhwa webcams with the
//! `webcam` feature).

mod frame_pool;
mod source;
pub mod synthetic;
mod traits;
#[cfg(feature = "webcam")]
pub mod webcam;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

pub use source::{CameraSource, next_device_id};
pub use synthetic::SyntheticCamera;
pub use traits::CameraBackend;
#[cfg(feature = "webcam")]
pub use webcam::WebcamBackend;

/// Highest frame rate accepted from the UI
pub const MAX_FRAME_RATE: u32 = 60;

// ── Capture configuration ───────────────────────────────────────

/// Supported capture resolution presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Dimensions", into = "Dimensions")]
pub enum Resolution {
    /// 640x480
    Vga,
    /// 1280x720
    Hd,
}

impl Resolution {
    /// All presets, in the order they are offered
    pub const ALL: [Resolution; 2] = [Resolution::Vga, Resolution::Hd];

    pub fn width(&self) -> u32 {
        match self {
            Resolution::Vga => 640,
            Resolution::Hd => 1280,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Resolution::Vga => 480,
            Resolution::Hd => 720,
        }
    }

    /// Short label shown in resolution pickers
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Vga => "640",
            Resolution::Hd => "1280",
        }
    }

    /// Map a width/height pair onto a preset
    pub fn from_dimensions(width: u32, height: u32) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|r| r.width() == width && r.height() == height)
            .ok_or(ConfigError::UnsupportedResolution { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width(), self.height())
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| ConfigError::Parse(s.to_string()))?;
        let width = w.parse().map_err(|_| ConfigError::Parse(s.to_string()))?;
        let height = h.parse().map_err(|_| ConfigError::Parse(s.to_string()))?;
        Self::from_dimensions(width, height)
    }
}

/// Serialized form of a resolution preset: `{"width": 1280, "height": 720}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl TryFrom<Dimensions> for Resolution {
    type Error = ConfigError;

    fn try_from(d: Dimensions) -> Result<Self, Self::Error> {
        Resolution::from_dimensions(d.width, d.height)
    }
}

impl From<Resolution> for Dimensions {
    fn from(r: Resolution) -> Self {
        Dimensions {
            width: r.width(),
            height: r.height(),
        }
    }
}

/// Capture configuration handed down to the camera backend.
///
/// The resolution is always one of the supported presets; frame rate is
/// validated by [`CaptureConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub device_id: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Hd,
            frame_rate: 30,
            device_id: None,
        }
    }
}

impl CaptureConfig {
    pub fn new(resolution: Resolution, frame_rate: u32) -> Result<Self, ConfigError> {
        let config = Self {
            resolution,
            frame_rate,
            device_id: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::FrameRate(self.frame_rate));
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.resolution.width()
    }

    pub fn height(&self) -> u32 {
        self.resolution.height()
    }

    pub fn with_resolution(&self, resolution: Resolution) -> Self {
        Self {
            resolution,
            ..self.clone()
        }
    }

    pub fn with_frame_rate(&self, frame_rate: u32) -> Self {
        Self {
            frame_rate,
            ..self.clone()
        }
    }

    pub fn with_device(&self, device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..self.clone()
        }
    }
}

/// A video input device as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
}

// ── Frames and live streams ─────────────────────────────────────

/// Decoded video image at a point in time.
///
/// Frames are cheap to clone and read-only. Consumers fetch the latest frame
/// from a [`LiveStream`] every cycle instead of holding on to one.
#[derive(Clone)]
pub struct Frame {
    sequence: u64,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self {
            sequence,
            image: Arc::new(image),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Recover the pixel buffer when no other consumer holds this frame
    pub(crate) fn into_image(self) -> Option<RgbImage> {
        Arc::try_unwrap(self.image).ok()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Properties of an opened camera stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Read-only subscription to a camera's frames.
///
/// Any number of consumers may hold one; none of them can alter the source.
#[derive(Clone)]
pub struct LiveStream {
    info: Arc<StreamInfo>,
    frames: watch::Receiver<Option<Frame>>,
}

impl LiveStream {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Latest decoded frame, `None` until the camera produces decodable data
    pub fn latest_frame(&self) -> Option<Frame> {
        self.frames.borrow().clone()
    }

    /// Whether at least one decodable frame has arrived
    pub fn is_ready(&self) -> bool {
        self.frames.borrow().is_some()
    }

    /// Wait until the first frame arrives. Returns false if the camera closed first.
    pub async fn ready(&mut self) -> bool {
        self.frames.wait_for(|frame| frame.is_some()).await.is_ok()
    }

    /// Wait for a frame newer than the last one returned. `None` once the camera closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            self.frames.changed().await.ok()?;
            if let Some(frame) = self.frames.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}

impl fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStream")
            .field("info", &self.info)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Owner side of an opened camera. Dropping it stops the capture.
pub struct LiveHandle {
    stream: LiveStream,
    stop: CancellationToken,
}

impl LiveHandle {
    pub fn info(&self) -> &StreamInfo {
        self.stream.info()
    }

    /// New read-only subscription
    pub fn stream(&self) -> LiveStream {
        self.stream.clone()
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Producer side used by camera backends
pub struct FramePublisher {
    tx: watch::Sender<Option<Frame>>,
    sequence: u64,
}

impl FramePublisher {
    /// Publish a new frame, returning the replaced one
    pub fn publish(&mut self, image: RgbImage) -> Option<Frame> {
        let frame = Frame::new(self.sequence, image);
        self.sequence += 1;
        self.tx.send_replace(Some(frame))
    }

    pub fn published(&self) -> u64 {
        self.sequence
    }
}

/// Create the channel between a backend's capture task and its consumers.
///
/// `stop` is cancelled when the returned handle is dropped.
pub fn live_channel(info: StreamInfo, stop: CancellationToken) -> (FramePublisher, LiveHandle) {
    let (tx, rx) = watch::channel(None);
    let handle = LiveHandle {
        stream: LiveStream {
            info: Arc::new(info),
            frames: rx,
        },
        stop,
    };
    (FramePublisher { tx, sequence: 0 }, handle)
}
