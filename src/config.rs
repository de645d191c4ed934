use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::pipeline::{ControllerConfig, RecordingConfig, RenderConfig, SamplingConfig};
use crate::pose::ModelConfig;

/// Application settings, read from a JSON file.
///
/// Every section is optional; missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub sampling: SamplingConfig,
    pub model: ModelConfig,
    pub render: RenderConfig,
    pub recording: RecordingConfig,
    pub health_log_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            sampling: SamplingConfig::default(),
            model: ModelConfig::default(),
            render: RenderConfig::default(),
            recording: RecordingConfig::default(),
            health_log_interval_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(json).context("parsing configuration")?;
        config.capture.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("loading {}", path.display()))
    }

    /// Settings for the pipeline controller
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            capture: self.capture.clone(),
            sampling: self.sampling.clone(),
            model: self.model.clone(),
            render: self.render.clone(),
            recording: self.recording.clone(),
            health_log_interval: Duration::from_secs(self.health_log_interval_secs),
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;
    use crate::encoder::ContainerFormat;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.capture.resolution, Resolution::Hd);
        assert_eq!(config.capture.frame_rate, 30);
        assert_eq!(config.sampling.failure_limit, 3);
        assert_eq!(config.render.keypoint_threshold, 0.6);
        assert_eq!(config.render.edge_threshold, 0.7);
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_json(
            r#"{
                "capture": { "resolution": { "width": 640, "height": 480 }, "frame_rate": 15 },
                "recording": { "format": "matroska", "auto_export": false },
                "health_log_interval_secs": 5
            }"#,
        )
        .unwrap();

        assert_eq!(config.capture.resolution, Resolution::Vga);
        assert_eq!(config.capture.frame_rate, 15);
        assert_eq!(config.recording.format, ContainerFormat::Matroska);
        assert!(!config.recording.auto_export);
        assert_eq!(config.recording.settle_limit, 8);
        assert_eq!(
            config.controller().health_log_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_rejects_unsupported_values() {
        let err = AppConfig::from_json(
            r#"{ "capture": { "resolution": { "width": 800, "height": 600 } } }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("800x600"));

        assert!(AppConfig::from_json(r#"{ "capture": { "frame_rate": 0 } }"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posecam.json");
        std::fs::write(&path, r#"{ "sampling": { "period_ms": 50 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.sampling.period_ms, 50);
        assert!(AppConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
