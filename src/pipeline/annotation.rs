//! Skeleton overlay drawing
//!
//! The overlay is a transparent RGBA canvas sized to the video frame and
//! composited over the preview by the UI.

use std::sync::Arc;

use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::pose::Pose;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Overlay shared between the sampling loop (writer) and the UI (reader)
pub type SharedSurface = Arc<Mutex<OverlaySurface>>;

/// Annotation canvas
#[derive(Debug, Clone)]
pub struct OverlaySurface {
    canvas: RgbaImage,
}

impl Default for OverlaySurface {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlaySurface {
    /// Empty 0x0 surface; sized on first render
    pub fn new() -> Self {
        Self {
            canvas: RgbaImage::new(0, 0),
        }
    }

    pub fn shared() -> SharedSurface {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.canvas
    }

    /// Match the canvas to the frame size. Contents are not preserved.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.canvas.dimensions() != (width, height) {
            self.canvas = RgbaImage::new(width, height);
        }
    }

    pub fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    /// Nothing drawn
    pub fn is_blank(&self) -> bool {
        self.painted_pixels() == 0
    }

    pub fn painted_pixels(&self) -> usize {
        self.canvas.pixels().filter(|p| p[3] != 0).count()
    }
}

/// Drawing thresholds and style
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Keypoints are drawn only above this confidence
    pub keypoint_threshold: f32,
    /// Edges are drawn only above this confidence
    pub edge_threshold: f32,
    pub keypoint_radius: u32,
    pub line_width: u32,
    pub color: [u8; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            keypoint_threshold: 0.6,
            edge_threshold: 0.7,
            keypoint_radius: 3,
            line_width: 2,
            // aqua
            color: [0, 255, 255, 255],
        }
    }
}

/// What one render call put on the canvas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub keypoints: usize,
    pub edges: usize,
}

pub struct AnnotationRenderer {
    config: RenderConfig,
}

impl AnnotationRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Replace the surface contents with `pose`.
    ///
    /// The surface is resized to the frame and cleared before drawing.
    pub fn render(
        &self,
        pose: &Pose,
        frame_width: u32,
        frame_height: u32,
        surface: &mut OverlaySurface,
    ) -> RenderStats {
        surface.resize(frame_width, frame_height);
        surface.clear();

        let color = Rgba(self.config.color);
        let mut stats = RenderStats::default();

        for keypoint in pose.keypoints() {
            if keypoint.score > self.config.keypoint_threshold {
                draw_filled_circle_mut(
                    &mut surface.canvas,
                    (keypoint.x.round() as i32, keypoint.y.round() as i32),
                    self.config.keypoint_radius as i32,
                    color,
                );
                stats.keypoints += 1;
            }
        }

        for edge in pose.edges() {
            if edge.score() > self.config.edge_threshold {
                self.draw_thick_line(
                    &mut surface.canvas,
                    (edge.from.x, edge.from.y),
                    (edge.to.x, edge.to.y),
                    color,
                );
                stats.edges += 1;
            }
        }

        stats
    }

    /// Parallel one-pixel segments, offset across the dominant axis
    fn draw_thick_line(
        &self,
        canvas: &mut RgbaImage,
        start: (f32, f32),
        end: (f32, f32),
        color: Rgba<u8>,
    ) {
        let steep = (end.1 - start.1).abs() > (end.0 - start.0).abs();
        let width = self.config.line_width.max(1) as i32;
        for i in 0..width {
            let offset = (i - (width - 1) / 2) as f32;
            let (dx, dy) = if steep { (offset, 0.0) } else { (0.0, offset) };
            draw_line_segment_mut(
                canvas,
                (start.0 + dx, start.1 + dy),
                (end.0 + dx, end.1 + dy),
                color,
            );
        }
    }
}

impl Default for AnnotationRenderer {
    fn default() -> Self {
        Self::new(RenderConfig::default())
    }
}
