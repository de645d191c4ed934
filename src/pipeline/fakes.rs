//! Scriptable collaborators for pipeline tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::recording::RecordingArtifact;
use crate::capture::{Frame, LiveStream};
use crate::encoder::{
    CHUNK_CHANNEL_CAPACITY, ContainerFormat, EncoderControl, EncoderSession, RecordingEncoder,
};
use crate::error::{ModelError, RecordingError};
use crate::pose::{
    Keypoint, KeypointName, ModelConfig, ModelHandle, Pose, PoseEstimator, PoseModel,
};
use crate::workers::UploadSink;

/// Every keypoint at score 0.9, spread across the frame
pub fn confident_pose(width: u32, height: u32) -> Pose {
    let w = width.max(2) as f32;
    let h = height.max(2) as f32;
    let keypoints = KeypointName::ALL
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let x = w * (0.25 + 0.5 * (i % 4) as f32 / 3.0);
            let y = h * (0.1 + 0.8 * i as f32 / 16.0);
            Keypoint::new(*name, x, y, 0.9)
        })
        .collect();
    Pose::new(keypoints)
}

#[derive(Debug, Default)]
pub struct EstimatorStats {
    calls: AtomicUsize,
    loads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl EstimatorStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

type Script = Arc<Mutex<VecDeque<Result<Pose, ModelError>>>>;

/// Estimator replaying scripted results, then confident poses
#[derive(Default)]
pub struct ScriptedEstimator {
    script: Script,
    latency: Duration,
    load_delay: Duration,
    fail_load: bool,
    stats: Arc<EstimatorStats>,
}

impl ScriptedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(self, results: Vec<Result<Pose, ModelError>>) -> Self {
        *self.script.lock().unwrap() = results.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn stats(&self) -> Arc<EstimatorStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl PoseEstimator for ScriptedEstimator {
    async fn load(&self, _config: &ModelConfig) -> Result<ModelHandle, ModelError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(ModelError::LoadFailed("scripted load failure".into()));
        }
        Ok(Box::new(ScriptedModel {
            script: self.script.clone(),
            latency: self.latency,
            stats: self.stats.clone(),
        }))
    }
}

struct ScriptedModel {
    script: Script,
    latency: Duration,
    stats: Arc<EstimatorStats>,
}

#[async_trait]
impl PoseModel for ScriptedModel {
    async fn estimate(&mut self, frame: &Frame) -> Result<Pose, ModelError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(confident_pose(frame.width(), frame.height())))
    }
}

/// Encoder emitting a fixed list of chunks, the last one after stop
pub struct FakeEncoder {
    format: ContainerFormat,
    chunks: Vec<Bytes>,
    fail_open: bool,
    hold_open: bool,
}

impl FakeEncoder {
    pub fn new(chunks: &[&'static [u8]]) -> Self {
        Self {
            format: ContainerFormat::WebM,
            chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
            fail_open: false,
            hold_open: false,
        }
    }

    /// Keeps its chunk stream open after the last chunk
    pub fn never_closing(chunks: &[&'static [u8]]) -> Self {
        Self {
            hold_open: true,
            ..Self::new(chunks)
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new(&[])
        }
    }
}

#[async_trait]
impl RecordingEncoder for FakeEncoder {
    fn format(&self) -> ContainerFormat {
        self.format
    }

    async fn open(&self, _stream: LiveStream) -> Result<EncoderSession, RecordingError> {
        if self.fail_open {
            return Err(RecordingError::Encoder("scripted encoder failure".into()));
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let control = EncoderControl::new();
        let stop = control.clone();
        let mut chunks = self.chunks.clone();
        let last = chunks.pop();
        let hold_open = self.hold_open;

        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            stop.stopped().await;
            if let Some(chunk) = last {
                let _ = tx.send(chunk).await;
            }
            if hold_open {
                tx.closed().await;
            }
        });

        Ok(EncoderSession {
            chunks: rx,
            control,
        })
    }
}

/// Upload sink recording what it was handed
#[derive(Default)]
pub struct RecordingUploadSink {
    uploads: Mutex<Vec<Arc<RecordingArtifact>>>,
}

impl RecordingUploadSink {
    pub fn uploads(&self) -> Vec<Arc<RecordingArtifact>> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadSink for RecordingUploadSink {
    async fn upload(&self, artifact: Arc<RecordingArtifact>) -> anyhow::Result<()> {
        self.uploads.lock().unwrap().push(artifact);
        Ok(())
    }
}
