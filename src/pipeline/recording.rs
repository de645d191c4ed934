//! Recording session state machine
//!
//! Collects encoder chunks while recording and turns them into a single
//! artifact once the encoder has delivered its last chunk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::encoder::{ContainerFormat, EncoderConfig, EncoderControl};
use crate::error::RecordingError;

/// Recording and export settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub format: ContainerFormat,
    pub encoder: EncoderConfig,
    /// Period of the finalization check after stop
    pub settle_interval_ms: u64,
    /// Unchanged checks before a stopped recording is finalized without
    /// the encoder closing its stream
    pub settle_limit: u32,
    pub export_dir: PathBuf,
    /// Write every finished recording to `export_dir`
    pub auto_export: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            format: ContainerFormat::default(),
            encoder: EncoderConfig::default(),
            settle_interval_ms: 250,
            settle_limit: 8,
            export_dir: PathBuf::from("."),
            auto_export: true,
        }
    }
}

impl RecordingConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms.max(1))
    }
}

/// Ordered chunks of the recording in progress
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    chunks: Vec<Bytes>,
    bytes: usize,
}

impl RecordingBuffer {
    fn push(&mut self, chunk: Bytes) {
        self.bytes += chunk.len();
        self.chunks.push(chunk);
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate in arrival order
    fn concat(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.bytes);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        data.freeze()
    }
}

/// A finished recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub id: u64,
    pub data: Bytes,
    pub format: ContainerFormat,
    pub chunk_count: usize,
    pub created_at: DateTime<Local>,
}

impl RecordingArtifact {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn file_name(&self) -> String {
        self.format.default_file_name()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Recording,
    /// Stop requested, waiting for the encoder's last chunk
    Finalizing,
    Ready(Arc<RecordingArtifact>),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Recording => "Recording",
            SessionState::Finalizing => "Finalizing",
            SessionState::Ready(_) => "Ready",
        }
    }
}

/// Outcome of a finalization attempt
pub type Finalized = Result<Arc<RecordingArtifact>, RecordingError>;

pub struct RecordingSession {
    state: SessionState,
    buffer: RecordingBuffer,
    format: ContainerFormat,
    control: Option<EncoderControl>,
    settle_limit: u32,
    stable_ticks: u32,
    last_count: usize,
    next_id: u64,
}

impl RecordingSession {
    /// `settle_limit` is the number of settle ticks without a new chunk after
    /// which a stopped recording is finalized even if the encoder never
    /// closed its stream.
    pub fn new(format: ContainerFormat, settle_limit: u32) -> Self {
        Self {
            state: SessionState::Idle,
            buffer: RecordingBuffer::default(),
            format,
            control: None,
            settle_limit: settle_limit.max(1),
            stable_ticks: 0,
            last_count: 0,
            next_id: 1,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn buffer(&self) -> &RecordingBuffer {
        &self.buffer
    }

    pub fn artifact(&self) -> Option<Arc<RecordingArtifact>> {
        match &self.state {
            SessionState::Ready(artifact) => Some(artifact.clone()),
            _ => None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    pub fn is_finalizing(&self) -> bool {
        self.state == SessionState::Finalizing
    }

    /// Begin a recording driven by the encoder behind `control`. Any prior
    /// buffer is discarded.
    pub fn start(&mut self, control: EncoderControl) -> Result<(), RecordingError> {
        match self.state {
            SessionState::Recording | SessionState::Finalizing => {
                return Err(RecordingError::AlreadyRecording);
            }
            SessionState::Ready(_) => return Err(RecordingError::ReviewPending),
            SessionState::Idle => {}
        }

        self.buffer.clear();
        self.control = Some(control);
        self.state = SessionState::Recording;
        info!("Recording started ({})", self.format);
        Ok(())
    }

    /// Append an encoder chunk. Empty chunks and chunks arriving outside a
    /// recording are dropped; returns whether the chunk was kept.
    pub fn push_chunk(&mut self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return false;
        }
        match self.state {
            SessionState::Recording | SessionState::Finalizing => {
                self.buffer.push(chunk);
                true
            }
            _ => {
                warn!("Dropping {} byte chunk outside a recording", chunk.len());
                false
            }
        }
    }

    /// Signal the encoder to flush and wait for its last chunk
    pub fn stop(&mut self) -> Result<(), RecordingError> {
        if self.state != SessionState::Recording {
            return Err(RecordingError::NotRecording);
        }

        if let Some(control) = &self.control {
            control.stop();
        }
        self.state = SessionState::Finalizing;
        self.stable_ticks = 0;
        self.last_count = self.buffer.chunk_count();
        info!(
            "Recording stopped, finalizing {} chunk(s)",
            self.buffer.chunk_count()
        );
        Ok(())
    }

    /// The encoder closed its chunk stream: no more chunks will arrive.
    ///
    /// Closing while still recording means the encoder died; whatever was
    /// buffered is finalized. Returns `None` when there was nothing to settle.
    pub fn end_of_stream(&mut self) -> Option<Finalized> {
        match self.state {
            SessionState::Recording => {
                warn!("Encoder stream ended while recording");
                Some(self.finalize())
            }
            SessionState::Finalizing => Some(self.finalize()),
            _ => None,
        }
    }

    /// Periodic check while finalizing. Finalizes once the chunk count stayed
    /// unchanged for the settle limit.
    pub fn settle_tick(&mut self) -> Option<Finalized> {
        if self.state != SessionState::Finalizing {
            return None;
        }

        let count = self.buffer.chunk_count();
        if count != self.last_count {
            self.last_count = count;
            self.stable_ticks = 0;
            return None;
        }

        self.stable_ticks += 1;
        if self.stable_ticks < self.settle_limit {
            return None;
        }

        debug!("Buffer settled at {} chunk(s) without end of stream", count);
        Some(self.finalize())
    }

    /// Finalize a stopped recording with what is buffered, without waiting
    /// for the encoder. Used when the camera feeding the encoder is lost.
    pub fn finish_now(&mut self) -> Option<Finalized> {
        if self.state != SessionState::Finalizing {
            return None;
        }
        if let Some(control) = &self.control {
            control.stop();
        }
        Some(self.finalize())
    }

    fn finalize(&mut self) -> Finalized {
        self.control = None;

        if self.buffer.is_empty() {
            self.state = SessionState::Idle;
            warn!("Recording produced no data");
            return Err(RecordingError::EmptyBuffer);
        }

        let artifact = Arc::new(RecordingArtifact {
            id: self.next_id,
            data: self.buffer.concat(),
            format: self.format,
            chunk_count: self.buffer.chunk_count(),
            created_at: Local::now(),
        });
        self.next_id += 1;

        info!(
            "Recording {} ready: {} bytes in {} chunk(s)",
            artifact.id,
            artifact.len(),
            artifact.chunk_count
        );
        self.state = SessionState::Ready(artifact.clone());
        Ok(artifact)
    }

    /// Discard the artifact and its buffer
    pub fn retake(&mut self) -> Result<(), RecordingError> {
        if !matches!(self.state, SessionState::Ready(_)) {
            return Err(RecordingError::NotReady);
        }
        self.buffer.clear();
        self.state = SessionState::Idle;
        info!("Recording discarded");
        Ok(())
    }

    /// Abort whatever is in progress and drop all data
    pub fn reset(&mut self) {
        if let Some(control) = self.control.take() {
            control.stop();
        }
        self.buffer.clear();
        self.state = SessionState::Idle;
    }
}
