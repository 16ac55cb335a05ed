//! Test doubles shared by the recorder's unit tests.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pagereel_core::{
    FrameEvent, FrameMetadata, NormalizedFrame, PageEvent, PageId, Result, ScreencastFrame,
    ScreencastOptions, ScreencastPage, TargetId, Viewport,
};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::encoder::{EncodeParams, EncoderCommand};

/// PNG of a single colour.
pub(crate) fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub(crate) fn png_base64(width: u32, height: u32, rgb: [u8; 3]) -> String {
    base64::engine::general_purpose::STANDARD.encode(png_bytes(width, height, rgb))
}

pub(crate) fn frame_event(target: &str, timestamp_ms: u64, bytes: Vec<u8>) -> FrameEvent {
    FrameEvent {
        target_id: TargetId::from(target),
        capture_timestamp_ms: timestamp_ms,
        raw_image: Bytes::from(bytes),
        raw_width: 0,
        raw_height: 0,
    }
}

/// Grey RGBA frame of the given geometry.
pub(crate) fn solid_frame(sequence: u64, width: u32, height: u32) -> NormalizedFrame {
    NormalizedFrame {
        sequence,
        pixels: Bytes::from(vec![0x80; NormalizedFrame::expected_len(width, height)]),
        width,
        height,
        capture_timestamp_ms: sequence * 40,
    }
}

/// Runs `script` under `/bin/sh` with the output path as `$1`.
pub(crate) struct ShellEncoder {
    script: String,
}

impl ShellEncoder {
    pub(crate) fn new(script: &str) -> Self {
        Self {
            script: script.to_owned(),
        }
    }

    /// Copies stdin to the output file.
    pub(crate) fn cat() -> Self {
        Self::new(r#"cat > "$1""#)
    }
}

impl EncoderCommand for ShellEncoder {
    fn program(&self) -> &str {
        "/bin/sh"
    }

    fn command(&self, params: &EncodeParams) -> Command {
        let mut cmd = Command::new("/bin/sh");
        let _ = cmd
            .arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(&params.output_path);
        cmd
    }
}

/// Browser call recorded by [`FakePage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Start(TargetId),
    Stop(TargetId),
    Ack(TargetId, i64),
}

/// Scripted page: events are pushed by the test, calls are recorded.
pub(crate) struct FakePage {
    id: PageId,
    main: TargetId,
    viewport: Viewport,
    calls: Mutex<Vec<Call>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PageEvent>>>,
}

impl FakePage {
    /// Page with main target `T1`.
    pub(crate) fn new(width: u32, height: u32) -> Arc<Self> {
        Self::with_viewport(Viewport::new(width, height))
    }

    pub(crate) fn with_viewport(viewport: Viewport) -> Arc<Self> {
        Arc::new(Self {
            id: PageId::new(),
            main: TargetId::from("T1"),
            viewport,
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn emit(&self, event: PageEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber, as when the browser connection goes away.
    pub(crate) fn close_events(&self) {
        self.subscribers.lock().clear();
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn emit_frame(&self, target: &str, ack_id: i64, timestamp_ms: u64, data: String) {
        self.emit(PageEvent::Frame(ScreencastFrame {
            target_id: TargetId::from(target),
            ack_id,
            data,
            metadata: FrameMetadata {
                device_width: f64::from(self.viewport.width),
                device_height: f64::from(self.viewport.height),
                timestamp: Some(timestamp_ms as f64 / 1000.0),
            },
        }));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn acks(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Ack(..)))
            .count()
    }

    /// Poll until `n` frames have been acknowledged.
    pub(crate) async fn wait_for_acks(&self, n: usize) {
        self.wait_until(|page| page.acks() >= n).await;
    }

    /// Poll until `cond` holds; panics after five seconds.
    pub(crate) async fn wait_until(&self, cond: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met, calls: {:?}",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ScreencastPage for FakePage {
    fn page_id(&self) -> PageId {
        self.id.clone()
    }

    fn main_target(&self) -> TargetId {
        self.main.clone()
    }

    async fn viewport(&self) -> Result<Viewport> {
        Ok(self.viewport)
    }

    async fn start_screencast(&self, target: &TargetId, _opts: &ScreencastOptions) -> Result<()> {
        self.calls.lock().push(Call::Start(target.clone()));
        Ok(())
    }

    async fn stop_screencast(&self, target: &TargetId) -> Result<()> {
        self.calls.lock().push(Call::Stop(target.clone()));
        Ok(())
    }

    async fn ack_frame(&self, target: &TargetId, ack_id: i64) -> Result<()> {
        self.calls.lock().push(Call::Ack(target.clone(), ack_id));
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
