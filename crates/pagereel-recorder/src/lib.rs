//! # pagereel-recorder
//!
//! Records a browser page into a video file.
//!
//! ```text
//! ScreencastPage ──events──▶ FrameSource ──bounded queue──▶ Normalizer ─▶ FramePacer ─▶ EncoderPipe
//!        ▲                        │                                                       (ffmpeg)
//!        └────────── ack ─────────┘
//! ```
//!
//! - **Session**: [`PageRecorder`] drives the lifecycle (`start`, `stop`,
//!   duration) and enforces one active recording per page
//! - **Source**: admits frames of the followed tab in arrival order and
//!   acknowledges them only once queued, so the browser is back-pressured
//! - **Normalize**: decodes each capture and letterboxes it onto a fixed,
//!   even-sized RGBA canvas
//! - **Encode**: streams raw frames to an encoder subprocess and reports
//!   its exit status with a stderr tail

#![deny(unsafe_code)]

pub mod encoder;
pub mod follow;
pub mod normalize;
pub mod pacing;
mod pipeline;
pub mod registry;
pub mod session;
mod source;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use encoder::{EncodeParams, EncoderCommand, EncoderPipe, ExitInfo, ExitResult, Ffmpeg};
pub use follow::{FollowDecision, TabFollow, TargetBinding};
pub use normalize::{Canvas, Normalizer, Placement, fit_within};
pub use pacing::FramePacer;
pub use registry::{ActivePages, PageLease};
pub use session::{PageRecorder, RecorderConfig, SessionState};
pub use stats::RecordingStats;
