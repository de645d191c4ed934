//! WebM / Matroska recording through FFmpeg
//!
//! Frames are sampled from the live stream at the capture rate, converted to
//! YUV420P and encoded on a blocking thread. The muxer writes straight into a
//! [`ChunkWriter`], so container bytes leave in timeslice chunks while the
//! recording is still running.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::mpsc::{Receiver, TrySendError, sync_channel};
use std::time::Duration;

use ac_ffmpeg::codec::video::{PixelFormat, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{Encoder, video};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use async_trait::async_trait;
use image::RgbImage;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};

use super::{
    CHUNK_CHANNEL_CAPACITY, ChunkWriter, ContainerFormat, EncoderConfig, EncoderControl,
    EncoderSession, RecordingEncoder,
};
use crate::capture::{Frame, LiveStream};
use crate::error::RecordingError;

/// Frames queued between the sampler and the encoder thread
const FRAME_QUEUE: usize = 4;

/// Encoder fallback chains, best first. Bitrate and GOP are appended from
/// the encoder configuration.
const WEBM_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "libvpx-vp9",
        &[
            ("deadline", "realtime"),
            ("cpu-used", "8"),
            ("row-mt", "1"),
            ("lag-in-frames", "0"),
        ],
    ),
    (
        "libvpx",
        &[
            ("deadline", "realtime"),
            ("cpu-used", "8"),
            ("lag-in-frames", "0"),
        ],
    ),
];

const MATROSKA_CHAIN: &[(&str, &[(&str, &str)])] = &[
    // NVIDIA NVENC
    (
        "h264_nvenc",
        &[("preset", "p2"), ("tune", "ll"), ("rc", "vbr"), ("gpu", "0")],
    ),
    // AMD AMF
    (
        "h264_amf",
        &[("usage", "lowlatency"), ("quality", "balanced"), ("rc", "vbr_peak")],
    ),
    // libx264 - CPU fallback
    (
        "libx264",
        &[
            ("profile", "main"),
            ("preset", "fast"),
            ("tune", "zerolatency"),
            ("bframes", "0"),
        ],
    ),
];

fn encoder_error(err: impl Display) -> RecordingError {
    RecordingError::Encoder(err.to_string())
}

pub struct FfmpegEncoder {
    format: ContainerFormat,
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(format: ContainerFormat, config: EncoderConfig) -> Self {
        Self { format, config }
    }
}

#[async_trait]
impl RecordingEncoder for FfmpegEncoder {
    fn format(&self) -> ContainerFormat {
        self.format
    }

    async fn open(&self, stream: LiveStream) -> Result<EncoderSession, RecordingError> {
        let (width, height, frame_rate) = {
            let info = stream.info();
            (info.width, info.height, info.frame_rate.max(1))
        };
        let format = self.format;
        let config = self.config.clone();

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = sync_channel::<Frame>(FRAME_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let writer = ChunkWriter::new(chunk_tx, config.timeslice());
            match EncodePipeline::open(format, &config, width, height, frame_rate, writer) {
                Ok(pipeline) => {
                    let _ = ready_tx.send(Ok(()));
                    pipeline.run(frame_rx);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| RecordingError::Encoder("encoder thread exited".into()))??;

        let control = EncoderControl::new();
        let stop = control.clone();

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs_f64(1.0 / frame_rate as f64));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => break,
                    _ = tick.tick() => {
                        let Some(frame) = stream.latest_frame() else { continue };
                        match frame_tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => debug!("Encoder busy, dropping frame"),
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                }
            }
            // Dropping the sender lets the encoder thread flush and close
        });

        Ok(EncoderSession {
            chunks: chunk_rx,
            control,
        })
    }
}

struct EncodePipeline {
    encoder: VideoEncoder,
    muxer: Muxer<ChunkWriter>,
    recycled: VecDeque<VideoFrame>,
    pixel_format: PixelFormat,
    time_base: TimeBase,
    w: usize,
    h: usize,
    frame_index: i64,
    codec_name: String,
}

impl EncodePipeline {
    fn open(
        format: ContainerFormat,
        config: &EncoderConfig,
        w: u32,
        h: u32,
        frame_rate: u32,
        writer: ChunkWriter,
    ) -> Result<Self, RecordingError> {
        let w = if w.is_multiple_of(2) { w } else { w + 1 } as usize;
        let h = if h.is_multiple_of(2) { h } else { h + 1 } as usize;
        let time_base = TimeBase::new(1, frame_rate.max(1) as i32);
        let pixel_format = video::frame::get_pixel_format("yuv420p");

        let (chain, muxer_name) = match format {
            ContainerFormat::WebM => (WEBM_CHAIN, "webm"),
            ContainerFormat::Matroska => (MATROSKA_CHAIN, "matroska"),
            ContainerFormat::Mjpeg => {
                return Err(RecordingError::Encoder(
                    "MJPEG is recorded by the built-in encoder".into(),
                ));
            }
        };

        let (encoder, codec_name) =
            Self::try_create_encoder(chain, config, frame_rate, w, h, time_base, pixel_format)?;
        info!("Using encoder: {} ({}x{} into {})", codec_name, w, h, muxer_name);

        let output_format = OutputFormat::find_by_name(muxer_name)
            .ok_or_else(|| RecordingError::Encoder(format!("muxer {muxer_name} unavailable")))?;
        let mut builder = Muxer::builder();
        builder
            .add_stream(&encoder.codec_parameters().into())
            .map_err(encoder_error)?;
        let muxer = builder
            .build(IO::from_write_stream(writer), output_format)
            .map_err(encoder_error)?;

        Ok(Self {
            encoder,
            muxer,
            recycled: VecDeque::new(),
            pixel_format,
            time_base,
            w,
            h,
            frame_index: 0,
            codec_name,
        })
    }

    fn try_create_encoder(
        chain: &[(&str, &[(&str, &str)])],
        config: &EncoderConfig,
        frame_rate: u32,
        w: usize,
        h: usize,
        time_base: TimeBase,
        pixel_format: PixelFormat,
    ) -> Result<(VideoEncoder, String), RecordingError> {
        let bitrate = config.bitrate.to_string();
        let gop = (frame_rate.max(1) * 2).to_string();

        for (codec, options) in chain {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(w)
                .height(h)
                .time_base(time_base)
                .set_option("b", &bitrate)
                .set_option("g", &gop);
            for (k, v) in *options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(enc) => return Ok((enc, codec.to_string())),
                Err(e) => {
                    debug!("Encoder {} failed to initialize: {}", codec, e);
                    continue;
                }
            }
        }

        Err(RecordingError::Encoder(
            "no usable video encoder, install FFmpeg with libvpx or libx264".into(),
        ))
    }

    fn run(mut self, frames: Receiver<Frame>) {
        while let Ok(frame) = frames.recv() {
            if let Err(err) = self.encode(frame.image()) {
                error!("{} failed to encode frame: {}", self.codec_name, err);
                break;
            }
        }

        match self.finish() {
            Ok(frames) => info!("Encoder stopped after {} frames", frames),
            Err(err) => error!("Failed to finalize recording: {}", err),
        }
    }

    /// Writable frame, reusing one the encoder has released
    fn take_frame(&mut self) -> VideoFrameMut {
        for _ in 0..self.recycled.len() {
            let Some(frame) = self.recycled.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                Err(frame) => self.recycled.push_back(frame),
            }
        }
        VideoFrameMut::black(self.pixel_format, self.w, self.h).with_time_base(self.time_base)
    }

    fn encode(&mut self, image: &RgbImage) -> Result<(), RecordingError> {
        let mut frame = self
            .take_frame()
            .with_pts(Timestamp::new(self.frame_index, self.time_base));
        self.frame_index += 1;

        {
            let mut planes = frame.planes_mut();
            let [y_plane, u_plane, v_plane] = &mut planes[..3] else {
                return Err(RecordingError::Encoder("expected three YUV planes".into()));
            };
            let (y_stride, u_stride, v_stride) =
                (y_plane.line_size(), u_plane.line_size(), v_plane.line_size());
            rgb_to_yuv420(
                image,
                (self.w, self.h),
                (y_plane.data_mut(), y_stride),
                (u_plane.data_mut(), u_stride),
                (v_plane.data_mut(), v_stride),
            );
        }

        let frame = frame.freeze();
        self.encoder.push(frame.clone()).map_err(encoder_error)?;
        if self.recycled.len() < FRAME_QUEUE * 2 {
            self.recycled.push_back(frame);
        }
        self.drain()
    }

    fn drain(&mut self) -> Result<(), RecordingError> {
        while let Some(packet) = self.encoder.take().map_err(encoder_error)? {
            self.muxer
                .push(packet.with_stream_index(0))
                .map_err(encoder_error)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<i64, RecordingError> {
        self.encoder.flush().map_err(encoder_error)?;
        self.drain()?;
        self.muxer.flush().map_err(encoder_error)?;
        let io = self.muxer.close().map_err(encoder_error)?;
        io.into_stream().finish().map_err(encoder_error)?;
        Ok(self.frame_index)
    }
}

/// BT.601 limited-range conversion with 2x2 chroma averaging.
///
/// `size` is the even encoder size; pixels past the image edge repeat the
/// last row/column.
fn rgb_to_yuv420(
    image: &RgbImage,
    size: (usize, usize),
    y_plane: (&mut [u8], usize),
    u_plane: (&mut [u8], usize),
    v_plane: (&mut [u8], usize),
) {
    let (w, h) = size;
    let (y_data, y_stride) = y_plane;
    let (u_data, u_stride) = u_plane;
    let (v_data, v_stride) = v_plane;
    if image.width() == 0 || image.height() == 0 {
        warn!("Skipping conversion of an empty image");
        return;
    }
    let max_x = image.width() - 1;
    let max_y = image.height() - 1;

    let rgb = |x: usize, y: usize| -> (i32, i32, i32) {
        let p = image.get_pixel((x as u32).min(max_x), (y as u32).min(max_y));
        (p[0] as i32, p[1] as i32, p[2] as i32)
    };

    for y in 0..h {
        let row = &mut y_data[y * y_stride..];
        for x in 0..w {
            let (r, g, b) = rgb(x, y);
            row[x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }

    for cy in 0..h / 2 {
        for cx in 0..w / 2 {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (pr, pg, pb) = rgb(cx * 2 + dx, cy * 2 + dy);
                r += pr;
                g += pg;
                b += pb;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            u_data[cy * u_stride + cx] =
                (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_data[cy * v_stride + cx] =
                (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }
}
