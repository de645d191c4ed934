use std::collections::VecDeque;

use image::{Rgb, RgbImage};

/// Upper bound of idle buffers kept around
const MAX_POOLED: usize = 4;

pub(crate) struct FramePool {
    frames: VecDeque<RgbImage>,
    w: u32,
    h: u32,
}

impl FramePool {
    pub fn new(w: u32, h: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            w,
            h,
        }
    }

    /// Put a given frame back to the pool after it was used.
    pub fn put(&mut self, frame: RgbImage) {
        if frame.dimensions() == (self.w, self.h) && self.frames.len() < MAX_POOLED {
            self.frames.push_back(frame);
        }
    }

    /// Take a writable frame from the pool or allocate a new one if necessary.
    pub fn take(&mut self) -> RgbImage {
        if let Some(frame) = self.frames.pop_front() {
            return frame;
        }

        RgbImage::from_pixel(self.w, self.h, Rgb([128, 128, 128]))
    }

    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.frames.len()
    }
}
