//! MoveNet single-pose inference through ONNX Runtime

use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::RgbImage;
use image::imageops::{self, FilterType};
use log::info;
use ndarray::Array4;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;

use super::{Keypoint, KeypointName, ModelConfig, ModelHandle, Pose, PoseEstimator, PoseModel};
use crate::capture::Frame;
use crate::error::ModelError;

#[derive(Debug, Default, Clone, Copy)]
pub struct MoveNetEstimator;

fn load_failed(err: impl Display) -> ModelError {
    ModelError::LoadFailed(err.to_string())
}

fn inference_failed(err: impl Display) -> ModelError {
    ModelError::InferenceFailed(err.to_string())
}

fn build_session(path: &Path) -> Result<Session, ModelError> {
    Session::builder()
        .map_err(load_failed)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_failed)?
        .commit_from_file(path)
        .map_err(load_failed)
}

#[async_trait]
impl PoseEstimator for MoveNetEstimator {
    async fn load(&self, config: &ModelConfig) -> Result<ModelHandle, ModelError> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| ModelError::LoadFailed("no model path configured".into()))?;

        info!("Loading pose model from {}", path.display());
        let session = tokio::task::spawn_blocking(move || build_session(&path))
            .await
            .map_err(load_failed)??;

        Ok(Box::new(MoveNetModel {
            session: Arc::new(Mutex::new(session)),
            config: config.clone(),
        }))
    }
}

struct MoveNetModel {
    session: Arc<Mutex<Session>>,
    config: ModelConfig,
}

#[async_trait]
impl PoseModel for MoveNetModel {
    async fn estimate(&mut self, frame: &Frame) -> Result<Pose, ModelError> {
        let session = self.session.clone();
        let config = self.config.clone();
        let frame = frame.clone();

        tokio::task::spawn_blocking(move || {
            let input = preprocess(frame.image(), config.input_size);
            let mut session = session
                .lock()
                .map_err(|_| ModelError::InferenceFailed("session lock poisoned".into()))?;
            infer(&mut session, &config, input, frame.width(), frame.height())
        })
        .await
        .map_err(inference_failed)?
    }
}

/// Resize to the square model input, NHWC float in 0..=255
fn preprocess(image: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let edge = size as usize;
    Array4::from_shape_fn((1, edge, edge, 3), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32
    })
}

fn infer(
    session: &mut Session,
    config: &ModelConfig,
    input: Array4<f32>,
    width: u32,
    height: u32,
) -> Result<Pose, ModelError> {
    let tensor = Tensor::from_array(input).map_err(inference_failed)?;
    let outputs = session
        .run(ort::inputs![config.input_name.as_str() => tensor])
        .map_err(inference_failed)?;
    let output: ndarray::ArrayViewD<f32> = outputs[config.output_name.as_str()]
        .try_extract_array()
        .map_err(inference_failed)?;

    // [1, 1, 17, 3] of normalized (y, x, score)
    if output.shape() != [1, 1, KeypointName::ALL.len(), 3] {
        return Err(ModelError::InferenceFailed(format!(
            "unexpected output shape {:?}",
            output.shape()
        )));
    }

    let keypoints = KeypointName::ALL
        .iter()
        .enumerate()
        .map(|(i, &name)| {
            Keypoint::new(
                name,
                output[[0, 0, i, 1]] * width as f32,
                output[[0, 0, i, 0]] * height as f32,
                output[[0, 0, i, 2]],
            )
        })
        .collect();

    Ok(Pose::new(keypoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_layout() {
        let image = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let tensor = preprocess(&image, 16);
        assert_eq!(tensor.shape(), &[1, 16, 16, 3]);
        assert_eq!(tensor[[0, 3, 5, 0]], 10.0);
        assert_eq!(tensor[[0, 3, 5, 2]], 30.0);
    }

    #[tokio::test]
    async fn test_missing_model_path() {
        let result = MoveNetEstimator.load(&ModelConfig::default()).await;
        assert!(matches!(result, Err(ModelError::LoadFailed(_))));
    }
}
