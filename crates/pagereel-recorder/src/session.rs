//! Recording session: lifecycle state machine and public contract.
//!
//! ```text
//! Idle → Starting → Recording → Stopping → Stopped
//!            ↘          ↘           ↘
//!                      Failed
//! ```
//!
//! A session owns three tasks: the frame source (adapter), the pipeline
//! (normalizer + encoder) and a monitor that fails the session as soon as
//! the pipeline reports an unrecoverable error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pagereel_core::{
    RecordDuration, RecorderError, RecordingOptions, Result, ScreencastOptions, ScreencastPage,
};
use pagereel_settings::PagereelSettings;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::encoder::{EncodeParams, EncoderCommand, EncoderPipe, ExitResult, Ffmpeg, failure};
use crate::follow::TabFollow;
use crate::normalize::{Canvas, Normalizer};
use crate::pacing::FramePacer;
use crate::pipeline::Pipeline;
use crate::registry::{ActivePages, PageLease};
use crate::source::{FrameSource, SourceExit};
use crate::stats::{Counters, RecordingStats};

/// Lifecycle state of a recording session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, never started.
    #[default]
    Idle,
    /// Resources are being set up.
    Starting,
    /// Frames are flowing to the encoder.
    Recording,
    /// Draining and finalizing the output.
    Stopping,
    /// Output finalized successfully.
    Stopped,
    /// Ended by an unrecoverable error.
    Failed,
}

impl SessionState {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a [`PageRecorder`] needs besides the page.
#[derive(Clone)]
pub struct RecorderConfig {
    /// Options used when `start` is called without any.
    pub defaults: RecordingOptions,
    /// Screencast parameters requested from the browser.
    pub screencast: ScreencastOptions,
    /// Capacity of the ordering queue between adapter and normalizer.
    pub queue_capacity: usize,
    /// Upper bound on `stop`.
    pub stop_timeout: Duration,
    /// Letterbox colour (RGBA).
    pub background: [u8; 4],
    /// Lines of encoder stderr kept for error reports.
    pub stderr_tail_lines: usize,
    /// Encoder process builder.
    pub encoder: Arc<dyn EncoderCommand>,
    /// Registry enforcing one active session per page.
    pub registry: Arc<ActivePages>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            defaults: RecordingOptions::default(),
            screencast: ScreencastOptions::default(),
            queue_capacity: 4,
            stop_timeout: Duration::from_secs(30),
            background: [0, 0, 0, 0xff],
            stderr_tail_lines: 20,
            encoder: Arc::new(Ffmpeg::default()),
            registry: ActivePages::global(),
        }
    }
}

impl fmt::Debug for RecorderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderConfig")
            .field("defaults", &self.defaults)
            .field("screencast", &self.screencast)
            .field("queue_capacity", &self.queue_capacity)
            .field("stop_timeout", &self.stop_timeout)
            .field("background", &self.background)
            .field("stderr_tail_lines", &self.stderr_tail_lines)
            .field("encoder", &self.encoder.program())
            .finish_non_exhaustive()
    }
}

impl RecorderConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PagereelSettings) -> Result<Self> {
        let background = settings
            .recorder
            .background_rgba()
            .map_err(|e| RecorderError::invalid_argument(e.to_string()))?;
        Ok(Self {
            defaults: settings.recorder.recording_options(),
            screencast: settings.screencast.clone(),
            queue_capacity: settings.recorder.queue_capacity.max(1),
            stop_timeout: Duration::from_millis(settings.recorder.stop_timeout_ms),
            background,
            stderr_tail_lines: settings.encoder.stderr_tail_lines,
            encoder: Arc::new(Ffmpeg::from_settings(&settings.encoder)),
            registry: ActivePages::global(),
        })
    }
}

#[derive(Default)]
struct Lifecycle {
    state: SessionState,
    output_path: Option<PathBuf>,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    stopped_at: Option<Instant>,
    last_encoder_error: Option<String>,
    exit: Option<ExitResult>,
    lease: Option<PageLease>,
}

impl Lifecycle {
    fn fail(&mut self, message: String) {
        self.state = SessionState::Failed;
        self.last_encoder_error = Some(message);
        if self.started_at.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
        self.lease = None;
    }
}

struct Shared {
    lifecycle: parking_lot::Mutex<Lifecycle>,
    counters: Arc<Counters>,
}

struct Running {
    cancel: CancellationToken,
    kill: CancellationToken,
    adapter: JoinHandle<SourceExit>,
    pipeline: AbortHandle,
    monitor: JoinHandle<Result<ExitResult>>,
}

impl Running {
    fn abort(&self) {
        self.cancel.cancel();
        self.kill.cancel();
        self.adapter.abort();
        self.pipeline.abort();
        self.monitor.abort();
    }
}

/// Records one page into a video file.
pub struct PageRecorder {
    page: Arc<dyn ScreencastPage>,
    config: RecorderConfig,
    shared: Arc<Shared>,
    running: parking_lot::Mutex<Option<Running>>,
}

impl PageRecorder {
    /// Recorder for `page`. Nothing happens until [`start`](Self::start).
    pub fn new(page: Arc<dyn ScreencastPage>, config: RecorderConfig) -> Self {
        Self {
            page,
            config,
            shared: Arc::new(Shared {
                lifecycle: parking_lot::Mutex::new(Lifecycle::default()),
                counters: Arc::new(Counters::default()),
            }),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Start recording into `output_path`.
    ///
    /// Uses the configured defaults when `options` is `None`. Validation
    /// happens before any resource is allocated.
    #[instrument(skip_all, fields(page_id = %self.page.page_id(), output_path = %output_path.display()))]
    pub async fn start(&self, output_path: &Path, options: Option<RecordingOptions>) -> Result<()> {
        let options = options.unwrap_or_else(|| self.config.defaults.clone());
        {
            let mut lc = self.shared.lifecycle.lock();
            match lc.state {
                SessionState::Idle => {}
                SessionState::Starting | SessionState::Recording => {
                    return Err(RecorderError::AlreadyActive {
                        page: self.page.page_id().to_string(),
                    });
                }
                other => {
                    return Err(RecorderError::InvalidState {
                        state: other.to_string(),
                    });
                }
            }
            options.validate_for(output_path)?;
            let lease = self.config.registry.acquire(&self.page.page_id())?;
            lc.state = SessionState::Starting;
            lc.lease = Some(lease);
            lc.output_path = Some(output_path.to_path_buf());
        }

        let running = match self.launch(output_path, &options).await {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "recording failed to start");
                self.shared.lifecycle.lock().fail(e.to_string());
                return Err(e);
            }
        };

        let mut lc = self.shared.lifecycle.lock();
        if lc.state != SessionState::Starting {
            running.abort();
            let message = lc
                .last_encoder_error
                .clone()
                .unwrap_or_else(|| "recording failed while starting".into());
            return Err(failure(message, None));
        }
        lc.state = SessionState::Recording;
        lc.started_at = Some(Instant::now());
        lc.started_wall = Some(Utc::now());
        *self.running.lock() = Some(running);
        info!(fps = options.output_frame_rate, "recording started");
        Ok(())
    }

    async fn launch(&self, output_path: &Path, options: &RecordingOptions) -> Result<Running> {
        let (raw_width, raw_height) = if options.video_frame.is_some() {
            (0, 0)
        } else {
            let viewport = self.page.viewport().await?;
            let frame = viewport.screencast_frame_size(&self.config.screencast);
            debug!(
                css_width = viewport.width,
                css_height = viewport.height,
                dpr = viewport.device_scale_factor,
                frame_width = frame.0,
                frame_height = frame.1,
                "screencast frame size"
            );
            frame
        };
        let canvas = Canvas::resolve(options, raw_width, raw_height)?;
        let params = EncodeParams {
            output_path: output_path.to_path_buf(),
            frame_rate: options.output_frame_rate,
            width: canvas.width,
            height: canvas.height,
            format: options.output_format,
        };
        let encoder = EncoderPipe::open(
            self.config.encoder.as_ref(),
            params,
            self.config.stderr_tail_lines,
        )
        .await?;
        let kill = encoder.kill_switch();

        let counters = Arc::clone(&self.shared.counters);
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let source = FrameSource::new(
            Arc::clone(&self.page),
            self.config.screencast.clone(),
            TabFollow::new(self.page.main_target(), options.follow_new_tab),
            queue_tx,
            Arc::clone(&counters),
            cancel.clone(),
        );

        let events = self.page.subscribe();
        source.subscribe().await?;

        let pipeline = Pipeline::new(
            Normalizer::new(canvas, self.config.background),
            FramePacer::new(options.output_frame_rate),
            encoder,
            counters,
        );
        let pipeline_task = tokio::spawn(pipeline.run(queue_rx));
        let pipeline_abort = pipeline_task.abort_handle();
        let monitor = tokio::spawn(monitor(
            pipeline_task,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        let adapter = tokio::spawn(source.run(events));

        debug!(width = canvas.width, height = canvas.height, "pipeline running");
        Ok(Running {
            cancel,
            kill,
            adapter,
            pipeline: pipeline_abort,
            monitor,
        })
    }

    /// Stop recording and finalize the output.
    ///
    /// Returns `true` only if the output file was finalized successfully.
    /// Calls in any state other than `Recording`, including concurrent
    /// calls while a stop is in progress, return `false` immediately.
    #[instrument(skip_all, fields(page_id = %self.page.page_id()))]
    pub async fn stop(&self) -> bool {
        let running = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state != SessionState::Recording {
                debug!(state = %lc.state, "stop ignored");
                return false;
            }
            lc.state = SessionState::Stopping;
            self.running.lock().take()
        };
        let Some(running) = running else {
            self.shared
                .lifecycle
                .lock()
                .fail("recording pipeline missing".into());
            return false;
        };

        running.cancel.cancel();
        let Running {
            kill,
            adapter,
            pipeline,
            monitor,
            ..
        } = running;
        let adapter_abort = adapter.abort_handle();
        let monitor_abort = monitor.abort_handle();

        let outcome = tokio::time::timeout(self.config.stop_timeout, async move {
            let _ = adapter.await;
            monitor.await
        })
        .await;

        let mut lc = self.shared.lifecycle.lock();
        match outcome {
            Ok(Ok(Ok(exit))) => {
                lc.state = SessionState::Stopped;
                lc.stopped_at = Some(Instant::now());
                lc.lease = None;
                info!(
                    frames = exit.frames_written,
                    bytes = exit.output_bytes,
                    "recording stopped"
                );
                lc.exit = Some(exit);
                true
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "recording failed while stopping");
                lc.fail(e.to_string());
                false
            }
            Ok(Err(join)) => {
                error!(error = %join, "recording task failed");
                lc.fail(format!("recording task failed: {join}"));
                false
            }
            Err(_) => {
                kill.cancel();
                pipeline.abort();
                adapter_abort.abort();
                monitor_abort.abort();
                let message = format!(
                    "encoder did not finish within {}ms",
                    self.config.stop_timeout.as_millis()
                );
                error!(%message, "stop timed out, encoder killed");
                lc.fail(message);
                false
            }
        }
    }

    /// Elapsed recording time as `HH:MM:SS:CC`; `00:00:00:00` if never
    /// started.
    pub fn get_record_duration(&self) -> String {
        self.record_duration().to_string()
    }

    /// Elapsed recording time.
    pub fn record_duration(&self) -> RecordDuration {
        let lc = self.shared.lifecycle.lock();
        match lc.started_at {
            Some(start) => RecordDuration::new(
                lc.stopped_at
                    .unwrap_or_else(Instant::now)
                    .saturating_duration_since(start),
            ),
            None => RecordDuration::ZERO,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().state
    }

    /// Frame counters.
    pub fn stats(&self) -> RecordingStats {
        self.shared.counters.snapshot()
    }

    /// Frames normalized so far.
    pub fn frame_count(&self) -> u64 {
        self.stats().frames_normalized
    }

    /// Output path of the current or last session.
    pub fn output_path(&self) -> Option<PathBuf> {
        self.shared.lifecycle.lock().output_path.clone()
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lifecycle.lock().started_wall
    }

    /// Message of the error that failed the session, if any.
    pub fn last_encoder_error(&self) -> Option<String> {
        self.shared.lifecycle.lock().last_encoder_error.clone()
    }

    /// Encoder result after a successful stop.
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.shared.lifecycle.lock().exit.clone()
    }
}

impl Drop for PageRecorder {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.abort();
        }
    }
}

/// Wait for the pipeline; fail the session on error.
async fn monitor(
    pipeline: JoinHandle<Result<ExitResult>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<ExitResult> {
    let result = match pipeline.await {
        Ok(result) => result,
        Err(join) => Err(failure(format!("encoder task failed: {join}"), None)),
    };
    if let Err(e) = &result {
        cancel.cancel();
        let mut lc = shared.lifecycle.lock();
        if matches!(lc.state, SessionState::Starting | SessionState::Recording) {
            error!(error = %e, "recording failed");
            lc.fail(e.to_string());
        }
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
