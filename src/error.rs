//! Error taxonomy for the capture pipeline
//!
//! Every component reports a narrow error type; the controller folds them into
//! [`PipelineError`] when replying to UI events.

use thiserror::Error;

use crate::pipeline::state::PipelineState;

/// Camera acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("camera device unavailable: {0}")]
    Unavailable(String),

    /// Media permission was refused. Terminal for the attempt; never retried.
    #[error("camera permission denied")]
    PermissionDenied,

    /// Switch requested but only one device exists. Callers treat it as a no-op.
    #[error("no alternative camera device")]
    NoAlternativeDevice,
}

/// Pose model failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("pose model failed to load: {0}")]
    LoadFailed(String),

    #[error("pose inference failed: {0}")]
    InferenceFailed(String),

    /// Raised by the sampling loop once the consecutive failure limit is hit.
    #[error("pose detection unavailable after {consecutive_failures} consecutive failures")]
    PoseUnavailable { consecutive_failures: u32 },
}

/// Recording lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordingError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording in progress")]
    NotRecording,

    #[error("recording produced no data")]
    EmptyBuffer,

    #[error("a finished recording is awaiting review")]
    ReviewPending,

    #[error("no finished recording to discard")]
    NotReady,

    #[error("encoder error: {0}")]
    Encoder(String),
}

/// Operation rejected by the controller for the current pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("operation not allowed while recording")]
    OperationNotAllowedWhileRecording,

    #[error("cannot {operation} while {from}")]
    InvalidTransition {
        from: PipelineState,
        operation: &'static str,
    },

    #[error("camera is not live")]
    NotLive,

    #[error("previous recording is still finalizing")]
    RecordingFinalizing,

    #[error("no recorded video available")]
    NoArtifact,
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported resolution {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    #[error("frame rate {0} out of range (1..=60)")]
    FrameRate(u32),

    #[error("invalid resolution '{0}', expected WIDTHxHEIGHT")]
    Parse(String),
}

/// Error returned by [`crate::pipeline::ControllerHandle::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("export failed: {0}")]
    Export(String),

    #[error("pipeline controller is not running")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = PipelineError::from(StateError::InvalidTransition {
            from: PipelineState::Reviewing,
            operation: "toggle pose detection",
        });
        assert_eq!(
            err.to_string(),
            "cannot toggle pose detection while Reviewing"
        );

        let err = PipelineError::from(ModelError::PoseUnavailable {
            consecutive_failures: 3,
        });
        assert!(err.to_string().contains("3 consecutive failures"));
    }
}
