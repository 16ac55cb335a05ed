//! Constant-frame-rate pacing.
//!
//! The browser only sends a frame when the page repaints, so captures are
//! irregular. Each frame is held until the next one arrives and then written
//! as many times as its display interval spans at the output frame rate.

use pagereel_core::NormalizedFrame;

/// Longest a single frame is held on screen, in seconds.
const MAX_HOLD_SECS: u64 = 600;

/// Turns irregular captures into repeat counts at a fixed frame rate.
#[derive(Debug)]
pub struct FramePacer {
    fps: u32,
    held: Option<NormalizedFrame>,
}

impl FramePacer {
    /// Pacer for `fps` output frames per second.
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            held: None,
        }
    }

    /// Number of output frames covering `from_ms..to_ms`, at least one.
    pub fn repeats(&self, from_ms: u64, to_ms: u64) -> u64 {
        let elapsed = to_ms.saturating_sub(from_ms);
        let fps = u64::from(self.fps);
        let count = elapsed.saturating_mul(fps).saturating_add(500) / 1000;
        count.clamp(1, MAX_HOLD_SECS * fps)
    }

    /// Hold `frame` and release the previous one with its repeat count.
    pub fn push(&mut self, frame: NormalizedFrame) -> Option<(NormalizedFrame, u64)> {
        let prev = self.held.replace(frame)?;
        let next_ts = self
            .held
            .as_ref()
            .map_or(prev.capture_timestamp_ms, |f| f.capture_timestamp_ms);
        let count = self.repeats(prev.capture_timestamp_ms, next_ts);
        Some((prev, count))
    }

    /// Release the last frame; it is written once.
    pub fn finish(&mut self) -> Option<NormalizedFrame> {
        self.held.take()
    }
}
