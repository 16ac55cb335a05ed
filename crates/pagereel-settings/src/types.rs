//! Settings types.
//!
//! All structs use camelCase on the wire to match `settings.json` and carry
//! `#[serde(default)]` so a partial file deep-merges cleanly.

use pagereel_core::options::{AspectRatio, OutputFormat, RecordingOptions, VideoFrame};
use pagereel_core::page::ScreencastOptions;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagereelSettings {
    /// Settings schema version.
    pub version: String,
    /// Recording session defaults.
    pub recorder: RecorderSettings,
    /// Parameters passed to `Page.startScreencast`.
    pub screencast: ScreencastOptions,
    /// Encoder subprocess settings.
    pub encoder: EncoderSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Default for PagereelSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            recorder: RecorderSettings::default(),
            screencast: ScreencastOptions::default(),
            encoder: EncoderSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PagereelSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.recorder
            .recording_options()
            .validate()
            .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
        if self.recorder.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "recorder.queueCapacity must be at least 1".into(),
            ));
        }
        let _ = self.recorder.background_rgba()?;
        if self.screencast.quality > 100 {
            return Err(SettingsError::InvalidValue(format!(
                "screencast.quality must be at most 100, got {}",
                self.screencast.quality
            )));
        }
        if self.screencast.every_nth_frame == 0 {
            return Err(SettingsError::InvalidValue(
                "screencast.everyNthFrame must be at least 1".into(),
            ));
        }
        if self.encoder.ffmpeg_path.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "encoder.ffmpegPath must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults for each recording session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Output frame rate.
    pub fps: u32,
    /// Follow tabs opened by the recorded page.
    pub follow_new_tab: bool,
    /// Explicit canvas width (requires `height`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Explicit canvas height (requires `width`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Canvas aspect ratio, used when no explicit size is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
    /// Output container format.
    pub format: OutputFormat,
    /// Frames buffered between capture and normalization.
    pub queue_capacity: usize,
    /// Upper bound on how long `stop` waits for the encoder to finalize.
    pub stop_timeout_ms: u64,
    /// Letterbox colour as `#rrggbb`.
    pub background_color: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            fps: pagereel_core::options::DEFAULT_FRAME_RATE,
            follow_new_tab: true,
            width: None,
            height: None,
            aspect_ratio: None,
            format: OutputFormat::Mp4,
            queue_capacity: 4,
            stop_timeout_ms: 30_000,
            background_color: "#000000".to_string(),
        }
    }
}

impl RecorderSettings {
    /// Build per-session [`RecordingOptions`] from these defaults.
    ///
    /// A canvas size is only used when both `width` and `height` are set.
    pub fn recording_options(&self) -> RecordingOptions {
        let video_frame = match (self.width, self.height) {
            (Some(width), Some(height)) => Some(VideoFrame { width, height }),
            _ => None,
        };
        RecordingOptions {
            output_frame_rate: self.fps,
            video_frame,
            aspect_ratio: self.aspect_ratio,
            follow_new_tab: self.follow_new_tab,
            output_format: self.format,
        }
    }

    /// Background colour as opaque RGBA.
    pub fn background_rgba(&self) -> Result<[u8; 4]> {
        parse_hex_color(&self.background_color).ok_or_else(|| {
            SettingsError::InvalidValue(format!(
                "recorder.backgroundColor '{}' is not #rrggbb",
                self.background_color
            ))
        })
    }
}

/// Parse `#rrggbb` (leading `#` optional) into opaque RGBA.
pub fn parse_hex_color(s: &str) -> Option<[u8; 4]> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?, 0xff])
}

/// Encoder subprocess settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncoderSettings {
    /// Path or name of the ffmpeg binary.
    pub ffmpeg_path: String,
    /// Codec override (defaults per output format when unset).
    pub video_codec: Option<String>,
    /// x264 preset.
    pub preset: String,
    /// Constant rate factor.
    pub crf: u8,
    /// Lines of encoder stderr kept for error reports.
    pub stderr_tail_lines: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            video_codec: None,
            preset: "ultrafast".to_string(),
            crf: 23,
            stderr_tail_lines: 20,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: pagereel_core::logging::DEFAULT_LEVEL.to_string(),
        }
    }
}
