//! Motion-JPEG recording
//!
//! Samples the live stream at its frame rate and appends each frame as a
//! baseline JPEG. The result plays with any decoder accepting raw MJPEG.

use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};

use super::{
    CHUNK_CHANNEL_CAPACITY, ChunkBuffer, ContainerFormat, EncoderConfig, EncoderControl,
    EncoderSession, RecordingEncoder,
};
use crate::capture::{Frame, LiveStream};
use crate::error::RecordingError;

pub struct MjpegEncoder {
    config: EncoderConfig,
}

impl MjpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self::new(EncoderConfig::default())
    }
}

async fn encode_jpeg(frame: Frame, quality: u8) -> Result<Vec<u8>, RecordingError> {
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(frame.image())
            .map_err(|e| RecordingError::Encoder(e.to_string()))?;
        Ok(out)
    })
    .await
    .map_err(|e| RecordingError::Encoder(e.to_string()))?
}

#[async_trait]
impl RecordingEncoder for MjpegEncoder {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Mjpeg
    }

    async fn open(&self, stream: LiveStream) -> Result<EncoderSession, RecordingError> {
        let frame_rate = stream.info().frame_rate.max(1);
        let quality = self.config.jpeg_quality.clamp(1, 100);
        let timeslice = self.config.timeslice();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let control = EncoderControl::new();
        let stop = control.clone();

        info!(
            "MJPEG encoder started: {}fps, quality {}, {:?} timeslice",
            frame_rate, quality, timeslice
        );

        tokio::spawn(async move {
            let mut buffer = ChunkBuffer::new(timeslice);
            let mut frame_tick = interval(Duration::from_secs_f64(1.0 / frame_rate as f64));
            frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut slice_tick = interval_at(Instant::now() + timeslice, timeslice);
            let mut frames = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => break,
                    _ = slice_tick.tick() => {
                        if let Some(chunk) = buffer.take() {
                            debug!("MJPEG chunk of {} bytes", chunk.len());
                            if tx.send(chunk).await.is_err() {
                                warn!("Recording session went away, stopping MJPEG encoder");
                                return;
                            }
                        }
                    }
                    _ = frame_tick.tick() => {
                        if let Some(frame) = stream.latest_frame() {
                            match encode_jpeg(frame, quality).await {
                                Ok(jpeg) => {
                                    buffer.push(&jpeg);
                                    frames += 1;
                                }
                                Err(err) => warn!("Dropping frame: {}", err),
                            }
                        }
                    }
                }
            }

            if let Some(chunk) = buffer.take() {
                let _ = tx.send(chunk).await;
            }
            info!("MJPEG encoder stopped after {} frames", frames);
        });

        Ok(EncoderSession {
            chunks: rx,
            control,
        })
    }
}
