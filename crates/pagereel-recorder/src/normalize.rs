//! Frame normalization: decode, fit into the output canvas, letterbox.
//!
//! The canvas is resolved once per session. Every [`NormalizedFrame`] has
//! exactly the canvas geometry, and sequence numbers are assigned by a single
//! counter owned by the [`Normalizer`] so they follow queue order with no
//! gaps, whichever target a frame came from.

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use pagereel_core::options::MAX_DIMENSION;
use pagereel_core::{FrameEvent, NormalizedFrame, RecorderError, RecordingOptions, Result};

/// Output canvas geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Canvas {
    /// Width in pixels (even).
    pub width: u32,
    /// Height in pixels (even).
    pub height: u32,
}

impl Canvas {
    /// Resolve the canvas for a session.
    ///
    /// An explicit `video_frame` wins. Otherwise an aspect ratio keeps the
    /// raw width and derives the height. Otherwise the raw size is used.
    /// Derived sizes are rounded down to even values.
    pub fn resolve(options: &RecordingOptions, raw_width: u32, raw_height: u32) -> Result<Self> {
        if let Some(frame) = options.video_frame {
            return Ok(Self {
                width: frame.width,
                height: frame.height,
            });
        }
        if raw_width == 0 || raw_height == 0 {
            return Err(RecorderError::invalid_argument(format!(
                "cannot derive a canvas from a {raw_width}x{raw_height} page"
            )));
        }
        let (width, height) = match options.aspect_ratio {
            Some(ratio) => {
                let width = raw_width.min(MAX_DIMENSION);
                let height = ratio.height_for(width);
                if height > MAX_DIMENSION {
                    (ratio.width_for(MAX_DIMENSION), MAX_DIMENSION)
                } else {
                    (width, height)
                }
            }
            None => (raw_width.min(MAX_DIMENSION), raw_height.min(MAX_DIMENSION)),
        };
        Ok(Self {
            width: even_floor(width),
            height: even_floor(height),
        })
    }
}

/// Round down to an even value, at least 2.
fn even_floor(v: u32) -> u32 {
    (v & !1).max(2)
}

/// Placement of a scaled source image inside the canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Scaled width.
    pub width: u32,
    /// Scaled height.
    pub height: u32,
    /// Left offset.
    pub x: u32,
    /// Top offset.
    pub y: u32,
}

/// Scale `src` to fit `canvas` preserving aspect ratio, centred.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn fit_within(src_width: u32, src_height: u32, canvas: Canvas) -> Placement {
    let scale = f64::min(
        f64::from(canvas.width) / f64::from(src_width.max(1)),
        f64::from(canvas.height) / f64::from(src_height.max(1)),
    );
    let width = ((f64::from(src_width) * scale).round() as u32).clamp(1, canvas.width);
    let height = ((f64::from(src_height) * scale).round() as u32).clamp(1, canvas.height);
    Placement {
        width,
        height,
        x: (canvas.width - width) / 2,
        y: (canvas.height - height) / 2,
    }
}

/// Turns raw captures into fixed-geometry RGBA frames.
#[derive(Debug)]
pub struct Normalizer {
    canvas: Canvas,
    background: Rgba<u8>,
    next_sequence: u64,
}

impl Normalizer {
    /// Normalizer for `canvas`, letterboxing with `background` (RGBA).
    pub fn new(canvas: Canvas, background: [u8; 4]) -> Self {
        Self {
            canvas,
            background: Rgba(background),
            next_sequence: 0,
        }
    }

    /// Output geometry.
    pub fn canvas(&self) -> Canvas {
        self.canvas
    }

    /// Sequence number the next successful frame will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Decode and fit one frame.
    ///
    /// Undecodable bytes fail with [`RecorderError::UnsupportedImageFormat`]
    /// and do not consume a sequence number.
    pub fn normalize(&mut self, frame: &FrameEvent) -> Result<NormalizedFrame> {
        let decoded = image::load_from_memory(&frame.raw_image)
            .map_err(|e| RecorderError::UnsupportedImageFormat {
                reason: e.to_string(),
            })?
            .to_rgba8();

        let pixels = self.fit(&decoded);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Ok(NormalizedFrame {
            sequence,
            pixels: Bytes::from(pixels.into_raw()),
            width: self.canvas.width,
            height: self.canvas.height,
            capture_timestamp_ms: frame.capture_timestamp_ms,
        })
    }

    fn fit(&self, src: &RgbaImage) -> RgbaImage {
        if src.dimensions() == (self.canvas.width, self.canvas.height) {
            return src.clone();
        }
        let place = fit_within(src.width(), src.height(), self.canvas);
        let mut out = RgbaImage::from_pixel(self.canvas.width, self.canvas.height, self.background);
        if (place.width, place.height) == src.dimensions() {
            imageops::replace(&mut out, src, i64::from(place.x), i64::from(place.y));
        } else {
            let scaled = imageops::resize(src, place.width, place.height, FilterType::Triangle);
            imageops::replace(&mut out, &scaled, i64::from(place.x), i64::from(place.y));
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
