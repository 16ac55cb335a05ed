//! Frame records passed between pipeline stages.

use bytes::Bytes;

use crate::ids::TargetId;

/// Bytes per pixel of a [`NormalizedFrame`] (RGBA).
pub const BYTES_PER_PIXEL: usize = 4;

/// A raw screencast capture, as delivered by the browser.
///
/// Created by the frame source adapter, moved through the ordering queue and
/// consumed exactly once by the normalizer.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    /// Target (tab) the frame was captured from.
    pub target_id: TargetId,
    /// Capture time in milliseconds since the Unix epoch.
    pub capture_timestamp_ms: u64,
    /// Encoded image bytes (JPEG or PNG).
    pub raw_image: Bytes,
    /// Width reported by the browser's frame metadata.
    pub raw_width: u32,
    /// Height reported by the browser's frame metadata.
    pub raw_height: u32,
}

/// A frame fitted to the output canvas, ready for the encoder.
#[derive(Clone, Debug)]
pub struct NormalizedFrame {
    /// Gapless, strictly increasing sequence number (starts at 0).
    pub sequence: u64,
    /// Tightly packed RGBA pixels, `width * height * 4` bytes.
    pub pixels: Bytes,
    /// Canvas width.
    pub width: u32,
    /// Canvas height.
    pub height: u32,
    /// Capture time carried over from the source [`FrameEvent`].
    pub capture_timestamp_ms: u64,
}

impl NormalizedFrame {
    /// Expected byte length of a frame of the given geometry.
    #[must_use]
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Whether the pixel buffer matches the declared geometry.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == Self::expected_len(self.width, self.height)
    }
}
