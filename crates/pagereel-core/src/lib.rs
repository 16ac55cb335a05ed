//! # pagereel-core
//!
//! Shared vocabulary for the pagereel crates:
//!
//! - **Branded IDs**: [`TargetId`] and [`PageId`] newtypes
//! - **Frames**: [`FrameEvent`] (raw screencast capture) and [`NormalizedFrame`]
//!   (fixed-geometry RGBA buffer ready for the encoder)
//! - **Options**: [`RecordingOptions`] with validation against an output path
//! - **Page seam**: the [`ScreencastPage`] trait the browser layer implements
//! - **Errors**: [`RecorderError`] taxonomy via `thiserror`
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod duration;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;
pub mod options;
pub mod page;

pub use duration::RecordDuration;
pub use errors::{RecorderError, Result};
pub use frame::{FrameEvent, NormalizedFrame};
pub use ids::{PageId, TargetId};
pub use options::{AspectRatio, OutputFormat, RecordingOptions, VideoFrame};
pub use page::{
    FrameMetadata, PageEvent, ScreencastFormat, ScreencastFrame, ScreencastOptions, ScreencastPage,
    Viewport,
};
