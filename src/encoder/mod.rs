//! Recording encoders
//!
//! An encoder subscribes to the live stream and emits the container byte
//! stream as chunks, one per timeslice. The chunk channel closes right after
//! the final chunk, which is how the recording session learns that the last
//! chunk has arrived.

mod chunk;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod mjpeg;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::LiveStream;
use crate::error::RecordingError;

pub use chunk::{ChunkBuffer, ChunkWriter};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegEncoder;
pub use mjpeg::MjpegEncoder;

/// Chunks buffered between an encoder and the recording session
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Container of the recorded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// VP9/VP8 in WebM
    WebM,
    /// H.264 in Matroska
    Matroska,
    /// Concatenated JPEG images
    Mjpeg,
}

impl Default for ContainerFormat {
    fn default() -> Self {
        if cfg!(feature = "ffmpeg") {
            ContainerFormat::WebM
        } else {
            ContainerFormat::Mjpeg
        }
    }
}

impl ContainerFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerFormat::WebM => "video/webm",
            ContainerFormat::Matroska => "video/x-matroska",
            ContainerFormat::Mjpeg => "video/x-motion-jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::WebM => "webm",
            ContainerFormat::Matroska => "mkv",
            ContainerFormat::Mjpeg => "mjpeg",
        }
    }

    /// Name offered when the artifact is saved
    pub fn default_file_name(&self) -> String {
        format!("recorded_video.{}", self.extension())
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Encoder tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Interval at which buffered output is emitted as a chunk
    pub timeslice_ms: u64,
    /// JPEG quality for the MJPEG encoder (1..=100)
    pub jpeg_quality: u8,
    /// Target bitrate for the ffmpeg encoders
    pub bitrate: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: 1000,
            jpeg_quality: 80,
            bitrate: 2_500_000,
        }
    }
}

impl EncoderConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms.max(1))
    }
}

/// Stop signal for a running encoder
#[derive(Debug, Clone, Default)]
pub struct EncoderControl {
    stop: CancellationToken,
}

impl EncoderControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the encoder to flush its final chunk and close the channel
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// A running encoder: its chunk output and its stop control
pub struct EncoderSession {
    pub chunks: mpsc::Receiver<Bytes>,
    pub control: EncoderControl,
}

/// Trait for recording encoders
#[async_trait]
pub trait RecordingEncoder: Send + Sync {
    fn format(&self) -> ContainerFormat;

    /// Start encoding frames from `stream`
    async fn open(&self, stream: LiveStream) -> Result<EncoderSession, RecordingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_metadata() {
        assert_eq!(ContainerFormat::WebM.mime_type(), "video/webm");
        assert_eq!(
            ContainerFormat::WebM.default_file_name(),
            "recorded_video.webm"
        );
        assert_eq!(
            ContainerFormat::Mjpeg.default_file_name(),
            "recorded_video.mjpeg"
        );
        assert_eq!(
            serde_json::to_string(&ContainerFormat::Matroska).unwrap(),
            r#""matroska""#
        );
    }

    #[test]
    fn test_control() {
        let control = EncoderControl::new();
        let clone = control.clone();
        assert!(!clone.is_stopped());
        control.stop();
        assert!(clone.is_stopped());
    }
}
