//! Physical cameras through nokhwa
//!
//! nokhwa cameras are blocking and not `Send` on every platform, so each open
//! stream owns a dedicated capture thread that publishes decoded RGB frames.

use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use log::{debug, error, info, warn};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution as NokhwaResolution,
};
use nokhwa::{Camera, NokhwaError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{CameraBackend, CaptureConfig, DeviceDescriptor, LiveHandle, StreamInfo, live_channel};
use crate::error::DeviceError;

/// Consecutive failed reads after which the device is considered gone
const MAX_READ_FAILURES: u32 = 50;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Counts consecutive `frame()` errors; any good read resets it.
#[derive(Debug)]
struct ReadFailures {
    count: u32,
    limit: u32,
}

impl ReadFailures {
    fn new(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    /// Returns true once the limit is reached
    fn record(&mut self) -> bool {
        self.count += 1;
        self.count >= self.limit
    }
}

pub struct WebcamBackend {
    api: ApiBackend,
}

impl Default for WebcamBackend {
    fn default() -> Self {
        Self {
            api: ApiBackend::Auto,
        }
    }
}

/// Camera errors carry no structured permission variant; match on the message
fn map_error(err: NokhwaError) -> DeviceError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied
    } else {
        DeviceError::Unavailable(message)
    }
}

fn camera_index(device_id: &str) -> CameraIndex {
    device_id
        .parse::<u32>()
        .map(CameraIndex::Index)
        .unwrap_or_else(|_| CameraIndex::String(device_id.to_string()))
}

#[async_trait]
impl CameraBackend for WebcamBackend {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let api = self.api;
        let cameras = tokio::task::spawn_blocking(move || nokhwa::query(api))
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .map_err(map_error)?;

        Ok(cameras
            .into_iter()
            .map(|info| DeviceDescriptor {
                id: info.index().as_string(),
                label: info.human_name(),
            })
            .collect())
    }

    async fn open(&self, config: &CaptureConfig) -> Result<LiveHandle, DeviceError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = config.clone();
        let stop = CancellationToken::new();

        thread::Builder::new()
            .name("posecam-webcam".into())
            .spawn(move || capture_thread(config, stop, ready_tx))
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| DeviceError::Unavailable("capture thread exited".into()))?
    }
}

fn capture_thread(
    config: CaptureConfig,
    stop: CancellationToken,
    ready_tx: oneshot::Sender<Result<LiveHandle, DeviceError>>,
) {
    let index = config
        .device_id
        .as_deref()
        .map(camera_index)
        .unwrap_or(CameraIndex::Index(0));

    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
        CameraFormat::new(
            NokhwaResolution::new(config.width(), config.height()),
            FrameFormat::MJPEG,
            config.frame_rate,
        ),
    ));

    let opened = Camera::new(index.clone(), requested).and_then(|mut camera| {
        camera.open_stream()?;
        Ok(camera)
    });
    let mut camera = match opened {
        Ok(camera) => camera,
        Err(err) => {
            let _ = ready_tx.send(Err(map_error(err)));
            return;
        }
    };

    let resolution = camera.resolution();
    let info = StreamInfo {
        device_id: index.as_string(),
        width: resolution.width(),
        height: resolution.height(),
        frame_rate: camera.frame_rate(),
    };
    info!("Webcam {} opened: {:?}", camera.info().human_name(), info);

    let (mut publisher, handle) = live_channel(info, stop.clone());
    if ready_tx.send(Ok(handle)).is_err() {
        // Caller gave up before the device came up
        let _ = camera.stop_stream();
        return;
    }

    let mut failures = ReadFailures::new(MAX_READ_FAILURES);
    while !stop.is_cancelled() {
        match camera.frame() {
            Ok(buffer) => {
                failures.reset();
                match buffer.decode_image::<RgbFormat>() {
                    Ok(decoded) => {
                        let (width, height) = decoded.dimensions();
                        if let Some(image) = RgbImage::from_raw(width, height, decoded.into_raw())
                        {
                            publisher.publish(image);
                        }
                    }
                    Err(err) => warn!("Dropping undecodable frame: {}", err),
                }
            }
            Err(err) => {
                if failures.record() {
                    // Dropping the publisher closes the stream for every consumer
                    error!(
                        "Webcam lost after {} failed reads: {}",
                        MAX_READ_FAILURES, err
                    );
                    break;
                }
                debug!("Webcam frame read failed: {}", err);
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    }

    if let Err(err) = camera.stop_stream() {
        error!("Failed to stop webcam stream: {}", err);
    }
    info!("Webcam stream stopped after {} frames", publisher.published());
}
