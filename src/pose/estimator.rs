//! Traits for pose estimation backends

use async_trait::async_trait;
use log::warn;

use super::{ModelConfig, Pose};
use crate::capture::Frame;
use crate::error::ModelError;

/// Loads pretrained pose models
#[async_trait]
pub trait PoseEstimator: Send + Sync {
    /// Load the model described by `config`. Slow; called once per pose
    /// activation, never per sampling tick.
    async fn load(&self, config: &ModelConfig) -> Result<ModelHandle, ModelError>;
}

/// A loaded model, owned by one sampling loop
#[async_trait]
pub trait PoseModel: Send {
    /// Estimate a single pose from `frame`. Keypoints are in frame pixels.
    async fn estimate(&mut self, frame: &Frame) -> Result<Pose, ModelError>;
}

pub type ModelHandle = Box<dyn PoseModel>;

/// Estimator used when no inference backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEstimator;

#[async_trait]
impl PoseEstimator for DisabledEstimator {
    async fn load(&self, _config: &ModelConfig) -> Result<ModelHandle, ModelError> {
        warn!("Pose detection requested but no inference backend is available");
        Err(ModelError::LoadFailed(
            "no pose inference backend compiled in (enable the `onnx` feature)".into(),
        ))
    }
}
