//! Traits for camera backends

use async_trait::async_trait;

use super::{CaptureConfig, DeviceDescriptor, LiveHandle};
use crate::error::DeviceError;

/// Trait for camera implementations
#[async_trait]
pub trait CameraBackend: Send + Sync {
    /// Enumerate the available video input devices
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Acquire the device named by `config` (or the default one) and start
    /// streaming frames. The capture stops when the handle is dropped.
    async fn open(&self, config: &CaptureConfig) -> Result<LiveHandle, DeviceError>;
}
