//! The browser seam: what the recorder needs from a page handle.
//!
//! [`ScreencastPage`] is implemented by the CDP client (`pagereel-cdp`) and
//! by scripted fakes in tests. Frame notifications are delivered with the
//! image still base64-encoded, exactly as they arrive on the wire; decoding
//! into a [`FrameEvent`](crate::FrameEvent) is the recorder's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::ids::{PageId, TargetId};

/// Screencast image format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreencastFormat {
    /// JPEG format.
    #[default]
    Jpeg,
    /// PNG format.
    Png,
}

impl ScreencastFormat {
    /// CDP protocol string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// Screencast configuration passed to `Page.startScreencast`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreencastOptions {
    /// JPEG quality (0-100).
    pub quality: u32,
    /// Image format.
    pub format: ScreencastFormat,
    /// Maximum capture width.
    pub max_width: u32,
    /// Maximum capture height.
    pub max_height: u32,
    /// Capture every Nth frame (1 = every frame).
    pub every_nth_frame: u32,
}

impl Default for ScreencastOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            format: ScreencastFormat::Jpeg,
            max_width: 1280,
            max_height: 800,
            every_nth_frame: 1,
        }
    }
}

/// Metadata attached to a screencast frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    /// Viewport width in device pixels.
    pub device_width: f64,
    /// Viewport height in device pixels.
    pub device_height: f64,
    /// Capture time in seconds since the Unix epoch, if the browser sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl FrameMetadata {
    /// Viewport size rounded to whole pixels.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn device_size(&self) -> (u32, u32) {
        let clamp = |v: f64| if v.is_finite() && v > 0.0 { v.round() as u32 } else { 0 };
        (clamp(self.device_width), clamp(self.device_height))
    }

    /// Capture time in milliseconds, if known.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.timestamp
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| (t * 1000.0).round() as u64)
    }
}

/// One `Page.screencastFrame` notification.
#[derive(Clone, Debug)]
pub struct ScreencastFrame {
    /// Target the frame was captured from.
    pub target_id: TargetId,
    /// Screencast session id to echo back in the acknowledgement.
    pub ack_id: i64,
    /// Base64-encoded image data.
    pub data: String,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Notifications delivered by a page handle.
#[derive(Clone, Debug)]
pub enum PageEvent {
    /// A screencast frame is ready and waits for acknowledgement.
    Frame(ScreencastFrame),
    /// A new page target appeared (e.g. a tab opened by the page).
    TargetCreated {
        /// The new target.
        target_id: TargetId,
        /// Target that opened it, if known.
        opener_id: Option<TargetId>,
    },
    /// A target was closed.
    TargetDestroyed {
        /// The closed target.
        target_id: TargetId,
    },
    /// A target navigated.
    Navigated {
        /// The navigating target.
        target_id: TargetId,
        /// New URL, if known.
        url: Option<String>,
        /// Whether the navigation tore down the target's screencast
        /// (cross-origin process swap detaches the debugging session).
        screencast_ended: bool,
    },
}

/// Size of a page's viewport.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
    /// Device pixels per CSS pixel (`window.devicePixelRatio`).
    pub device_scale_factor: f64,
}

impl Viewport {
    /// Viewport at a device scale factor of 1.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            device_scale_factor: 1.0,
        }
    }

    /// Size of the frames a screencast of this viewport delivers.
    ///
    /// The browser captures device pixels and scales the capture down, keeping
    /// its aspect ratio, until it fits `opts.max_width` x `opts.max_height`.
    /// A zero maximum leaves that axis unbounded.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn screencast_frame_size(&self, opts: &ScreencastOptions) -> (u32, u32) {
        let dpr = if self.device_scale_factor.is_finite() && self.device_scale_factor > 0.0 {
            self.device_scale_factor
        } else {
            1.0
        };
        let width = f64::from(self.width) * dpr;
        let height = f64::from(self.height) * dpr;
        if width <= 0.0 || height <= 0.0 {
            return (0, 0);
        }
        let bound = |max: u32, len: f64| {
            if max == 0 { 1.0 } else { f64::from(max) / len }
        };
        let scale = bound(opts.max_width, width)
            .min(bound(opts.max_height, height))
            .min(1.0);
        let fit = |len: f64| ((len * scale).round() as u32).max(1);
        (fit(width), fit(height))
    }
}

/// A browser page that can stream screencast frames.
#[async_trait]
pub trait ScreencastPage: Send + Sync {
    /// Identity of this page handle.
    fn page_id(&self) -> PageId;

    /// Target the page handle currently points at.
    fn main_target(&self) -> TargetId;

    /// Current viewport size.
    async fn viewport(&self) -> Result<Viewport>;

    /// Begin emitting `Frame` events for `target`.
    async fn start_screencast(&self, target: &TargetId, opts: &ScreencastOptions) -> Result<()>;

    /// Stop emitting frames for `target`.
    async fn stop_screencast(&self, target: &TargetId) -> Result<()>;

    /// Acknowledge a frame so the browser sends the next one.
    async fn ack_frame(&self, target: &TargetId, ack_id: i64) -> Result<()>;

    /// Subscribe to page events.
    ///
    /// The channel is unbounded on purpose: frame volume is bounded by the
    /// browser, which withholds new frames until earlier ones are
    /// acknowledged.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PageEvent>;
}
