//! Recording options and their validation.
//!
//! Options are immutable for the lifetime of a session and validated once,
//! at `start`, before any resource is allocated.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{RecorderError, Result};

/// Largest accepted canvas edge, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

/// Highest accepted output frame rate.
pub const MAX_FRAME_RATE: u32 = 240;

/// Default output frame rate.
pub const DEFAULT_FRAME_RATE: u32 = 25;

/// Explicit output canvas size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrame {
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
}

/// Aspect ratio given as `"W:H"`, e.g. `"16:9"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    /// Width term.
    pub width: u32,
    /// Height term.
    pub height: u32,
}

impl AspectRatio {
    /// Height matching `width` under this ratio.
    #[must_use]
    pub fn height_for(&self, width: u32) -> u32 {
        let h = u64::from(width) * u64::from(self.height) / u64::from(self.width);
        u32::try_from(h).unwrap_or(u32::MAX)
    }

    /// Width matching `height` under this ratio.
    #[must_use]
    pub fn width_for(&self, height: u32) -> u32 {
        let w = u64::from(height) * u64::from(self.width) / u64::from(self.height);
        u32::try_from(w).unwrap_or(u32::MAX)
    }
}

impl FromStr for AspectRatio {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RecorderError::invalid_argument(format!("aspect ratio '{s}' is not W:H"));
        let (w, h) = s.trim().split_once(':').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = RecorderError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(r: AspectRatio) -> Self {
        r.to_string()
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

/// Output container format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// MPEG-4 container with H.264 video.
    #[default]
    Mp4,
    /// `WebM` container with VP9 video.
    Webm,
}

impl OutputFormat {
    /// File extension, without the dot.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    /// Whether `path` carries this format's extension (case-insensitive).
    #[must_use]
    pub fn matches_path(&self, path: &Path) -> bool {
        let has_stem = path.file_stem().is_some_and(|s| !s.is_empty());
        has_stem
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(self.extension()))
    }
}

impl FromStr for OutputFormat {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            other => Err(RecorderError::invalid_argument(format!(
                "unsupported output format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Options for one recording session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingOptions {
    /// Nominal output frame rate.
    #[serde(rename = "fps")]
    pub output_frame_rate: u32,
    /// Explicit canvas size. Takes precedence over `aspect_ratio`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_frame: Option<VideoFrame>,
    /// Canvas aspect ratio, used to derive the canvas from the page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
    /// Follow tabs opened during the recording.
    pub follow_new_tab: bool,
    /// Output container format; must match the output path's extension.
    #[serde(rename = "format")]
    pub output_format: OutputFormat,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            output_frame_rate: DEFAULT_FRAME_RATE,
            video_frame: None,
            aspect_ratio: None,
            follow_new_tab: true,
            output_format: OutputFormat::Mp4,
        }
    }
}

impl RecordingOptions {
    /// Validate the options on their own.
    pub fn validate(&self) -> Result<()> {
        if self.output_frame_rate == 0 || self.output_frame_rate > MAX_FRAME_RATE {
            return Err(RecorderError::invalid_argument(format!(
                "frame rate must be between 1 and {MAX_FRAME_RATE}, got {}",
                self.output_frame_rate
            )));
        }
        if let Some(frame) = self.video_frame {
            for (name, value) in [("width", frame.width), ("height", frame.height)] {
                if value == 0 || value > MAX_DIMENSION {
                    return Err(RecorderError::invalid_argument(format!(
                        "video frame {name} must be between 1 and {MAX_DIMENSION}, got {value}"
                    )));
                }
                if value % 2 != 0 {
                    return Err(RecorderError::invalid_argument(format!(
                        "video frame {name} must be even, got {value}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the options together with the output path.
    ///
    /// Fails with `InvalidArgument` when the path does not end in the output
    /// format's extension (e.g. `"./out/"`).
    pub fn validate_for(&self, output_path: &Path) -> Result<()> {
        if !self.output_format.matches_path(output_path) {
            return Err(RecorderError::invalid_argument(format!(
                "output path '{}' should have .{} extension",
                output_path.display(),
                self.output_format.extension()
            )));
        }
        self.validate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
