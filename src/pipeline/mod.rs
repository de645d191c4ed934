//! Capture-and-annotation pipeline
//!
//! The controller owns the top-level state and drives three collaborators:
//! - the camera source, publishing a read-only live stream
//! - the pose sampling loop, estimating poses and drawing them onto the
//!   overlay surface
//! - the recording session, assembling encoder chunks into an artifact
//!
//! UI code talks to the controller only through [`ControllerHandle`].

pub mod annotation;
pub mod controller;
pub mod health;
pub mod recording;
pub mod sampling;
pub mod state;

#[cfg(test)]
pub(crate) mod fakes;

pub use annotation::{AnnotationRenderer, OverlaySurface, RenderConfig, RenderStats, SharedSurface};
pub use controller::{
    Ack, Collaborators, ControllerConfig, ControllerHandle, PipelineController, PipelineEvent,
    PipelineStatus, PoseCondition,
};
pub use health::{HealthSummary, PipelineHealth};
pub use recording::{RecordingArtifact, RecordingBuffer, RecordingConfig, RecordingSession, SessionState};
pub use sampling::{PoseSamplingLoop, SamplingConfig, SamplingEvent, SamplingState};
pub use state::PipelineState;
