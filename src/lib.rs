//! Live camera capture with a real-time pose skeleton overlay and recording.
//!
//! The [`pipeline::PipelineController`] coordinates a camera backend, a pose
//! estimator and a recording encoder. Everything hardware-specific sits
//! behind a trait so the pipeline runs identically on synthetic sources.

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod pose;
pub mod workers;

pub use config::AppConfig;
pub use error::{
    ConfigError, DeviceError, ModelError, PipelineError, RecordingError, StateError,
};
pub use pipeline::{
    Ack, Collaborators, ControllerConfig, ControllerHandle, PipelineController, PipelineEvent,
    PipelineState, PipelineStatus,
};
