//! Synthetic camera producing a moving test pattern
//!
//! Used when no physical camera backend is compiled in, and by the tests to
//! script device lists, warm-up delays and acquisition failures.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use log::{debug, info};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;

use super::frame_pool::FramePool;
use super::{CameraBackend, CaptureConfig, DeviceDescriptor, LiveHandle, StreamInfo, live_channel};
use crate::error::DeviceError;

const BAR_WIDTH: u32 = 32;

pub struct SyntheticCamera {
    devices: Vec<DeviceDescriptor>,
    warmup: Duration,
    permission_denied: AtomicBool,
    failing: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    streams: Mutex<Vec<CancellationToken>>,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCamera {
    /// Single device named `synthetic-0`
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// `count` devices named `synthetic-0`, `synthetic-1`, ...
    pub fn with_devices(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| DeviceDescriptor {
                id: format!("synthetic-{i}"),
                label: format!("Synthetic Camera {i}"),
            })
            .collect();

        Self {
            devices,
            warmup: Duration::ZERO,
            permission_denied: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Delay before the first frame of every stream
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Refuse every following acquisition with `PermissionDenied`
    pub fn deny_permission(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Make acquisitions of `device_id` fail with `Unavailable`
    pub fn fail_device(&self, device_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(device_id.to_string());
        }
    }

    /// Number of successful acquisitions so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams whose handle is still alive
    pub fn active_streams(&self) -> usize {
        self.streams
            .lock()
            .map(|streams| streams.iter().filter(|s| !s.is_cancelled()).count())
            .unwrap_or(0)
    }

    fn resolve_device(&self, config: &CaptureConfig) -> Result<String, DeviceError> {
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }

        let device = match &config.device_id {
            Some(id) => self.devices.iter().find(|d| &d.id == id),
            None => self.devices.first(),
        }
        .ok_or_else(|| {
            DeviceError::Unavailable(format!(
                "no such device: {}",
                config.device_id.as_deref().unwrap_or("<default>")
            ))
        })?;

        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&device.id))
            .unwrap_or(false);
        if failing {
            return Err(DeviceError::Unavailable(format!(
                "{} is busy",
                device.label
            )));
        }

        Ok(device.id.clone())
    }
}

#[async_trait]
impl CameraBackend for SyntheticCamera {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.devices.clone())
    }

    async fn open(&self, config: &CaptureConfig) -> Result<LiveHandle, DeviceError> {
        let device_id = self.resolve_device(config)?;

        let stop = CancellationToken::new();
        let (mut publisher, handle) = live_channel(
            StreamInfo {
                device_id: device_id.clone(),
                width: config.width(),
                height: config.height(),
                frame_rate: config.frame_rate,
            },
            stop.clone(),
        );

        if let Ok(mut streams) = self.streams.lock() {
            streams.retain(|s| !s.is_cancelled());
            streams.push(stop.clone());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (width, height) = (config.width(), config.height());
        let period = Duration::from_secs_f64(1.0 / config.frame_rate as f64);
        let warmup = self.warmup;
        info!("Synthetic camera {} opened at {}x{}", device_id, width, height);

        tokio::spawn(async move {
            let mut pool = FramePool::new(width, height);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            if !warmup.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sleep(warmup) => {}
                }
            }

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut image = pool.take();
                paint_pattern(&mut image, publisher.published());
                if let Some(image) = publisher.publish(image).and_then(|old| old.into_image()) {
                    pool.put(image);
                }
            }

            debug!("Synthetic camera {} stopped after {} frames", device_id, publisher.published());
        });

        Ok(handle)
    }
}

/// Gray background with a bright bar sweeping left to right
fn paint_pattern(image: &mut RgbImage, sequence: u64) {
    let width = image.width();
    let bar_start = ((sequence * 8) % width.max(1) as u64) as u32;

    for (x, _, pixel) in image.enumerate_pixels_mut() {
        let in_bar = x >= bar_start && x < bar_start + BAR_WIDTH;
        *pixel = if in_bar {
            Rgb([230, 230, 230])
        } else {
            Rgb([64, 64, 72])
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;

    #[tokio::test]
    async fn test_streams_frames_at_configured_size() {
        let camera = SyntheticCamera::new();
        let config = CaptureConfig::new(Resolution::Vga, 30).unwrap();
        let handle = camera.open(&config).await.unwrap();
        let mut stream = handle.stream();

        let first = stream.next_frame().await.unwrap();
        let second = stream.next_frame().await.unwrap();
        assert_eq!((first.width(), first.height()), (640, 480));
        assert!(second.sequence() > first.sequence());
        assert_eq!(camera.active_streams(), 1);

        drop(handle);
        assert_eq!(camera.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_delays_first_frame() {
        let camera = SyntheticCamera::new().with_warmup(Duration::from_secs(2));
        let handle = camera.open(&CaptureConfig::default()).await.unwrap();
        let mut stream = handle.stream();

        sleep(Duration::from_secs(1)).await;
        assert!(!stream.is_ready());

        assert!(stream.ready().await);
        assert!(stream.latest_frame().is_some());
    }

    #[tokio::test]
    async fn test_acquisition_failures() {
        let camera = SyntheticCamera::with_devices(2);
        let err = camera
            .open(&CaptureConfig::default().with_device("missing"))
            .await
            .err();
        assert!(matches!(err, Some(DeviceError::Unavailable(_))));

        camera.deny_permission(true);
        let err = camera.open(&CaptureConfig::default()).await.err();
        assert_eq!(err, Some(DeviceError::PermissionDenied));
        assert_eq!(camera.open_count(), 0);
    }

    #[test]
    fn test_pattern_moves() {
        let mut a = RgbImage::new(64, 4);
        let mut b = RgbImage::new(64, 4);
        paint_pattern(&mut a, 0);
        paint_pattern(&mut b, 1);
        assert_ne!(a, b);
        assert_eq!(a.get_pixel(0, 0), &Rgb([230, 230, 230]));
    }
}
