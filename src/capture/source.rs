//! Camera source: owns the opened device and applies reconfiguration

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{CameraBackend, CaptureConfig, DeviceDescriptor, LiveHandle, LiveStream};
use crate::error::DeviceError;

/// Pick the device a "switch camera" request moves to.
///
/// The first device whose id differs from `current`; without a current
/// device, the first one. Fewer than two devices leaves nothing to switch to.
pub fn next_device_id(
    devices: &[DeviceDescriptor],
    current: Option<&str>,
) -> Result<String, DeviceError> {
    if devices.len() < 2 {
        return Err(DeviceError::NoAlternativeDevice);
    }

    let next = match current {
        Some(current) => devices.iter().find(|d| d.id != current),
        None => devices.first(),
    };

    next.map(|d| d.id.clone())
        .ok_or(DeviceError::NoAlternativeDevice)
}

/// Acquires and releases the camera for the pipeline.
///
/// Holds at most one open device. Each configuration change releases the
/// previous stream before opening the new one, so a physical camera is never
/// opened twice.
pub struct CameraSource {
    backend: Arc<dyn CameraBackend>,
    config: CaptureConfig,
    handle: Option<LiveHandle>,
}

impl CameraSource {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CaptureConfig) -> Self {
        Self {
            backend,
            config,
            handle: None,
        }
    }

    /// Configuration of the open stream, or the one the next open will use
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Store a configuration without touching the device
    pub fn set_config(&mut self, config: CaptureConfig) {
        self.config = config;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Id of the device currently streaming
    pub fn current_device(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.info().device_id.as_str())
    }

    /// New subscription to the open stream
    pub fn stream(&self) -> Option<LiveStream> {
        self.handle.as_ref().map(LiveHandle::stream)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.backend.list_devices().await
    }

    /// (Re)open the camera with `config`.
    ///
    /// On failure the previous configuration is restored when possible. A
    /// permission refusal is returned as is and leaves the camera closed.
    pub async fn configure(&mut self, config: CaptureConfig) -> Result<LiveStream, DeviceError> {
        let had_stream = self.handle.take().is_some();

        match self.backend.open(&config).await {
            Ok(handle) => {
                let info = handle.info();
                info!(
                    "Camera {} streaming at {}x{} @ {}fps",
                    info.device_id, info.width, info.height, info.frame_rate
                );
                let stream = handle.stream();
                self.config = config;
                self.handle = Some(handle);
                Ok(stream)
            }
            Err(err) => {
                error!("Failed to open camera with {:?}: {}", config, err);
                if had_stream && err != DeviceError::PermissionDenied {
                    self.restore().await;
                }
                Err(err)
            }
        }
    }

    async fn restore(&mut self) {
        match self.backend.open(&self.config).await {
            Ok(handle) => {
                warn!("Restored previous camera configuration {:?}", self.config);
                self.handle = Some(handle);
            }
            Err(err) => warn!("Could not restore previous camera: {}", err),
        }
    }

    /// Device a switch request would move to
    pub async fn next_device(&self) -> Result<String, DeviceError> {
        let devices = self.list_devices().await?;
        debug!("{} camera device(s) available", devices.len());
        let current = self
            .current_device()
            .or(self.config.device_id.as_deref())
            .map(str::to_owned);
        next_device_id(&devices, current.as_deref())
    }

    /// Reopen the stream on `device_id`, keeping resolution and frame rate
    pub async fn switch_device(&mut self, device_id: &str) -> Result<LiveStream, DeviceError> {
        info!("Switching camera to {}", device_id);
        let config = self.config.with_device(device_id);
        self.configure(config).await
    }

    /// Release the device
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            info!("Camera released");
        }
    }
}
