//! Frame source adapter.
//!
//! The adapter task is the single serialization point between the browser
//! and the pipeline. It reads page events in order, admits frames of the
//! current target into the bounded queue and acknowledges each frame only
//! after admission, so a slow encoder pauses the browser. Target switches
//! go through a barrier: every frame of the old target is processed before
//! the new target's screencast starts.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use bytes::Bytes;
use pagereel_core::{
    FrameEvent, PageEvent, Result, ScreencastFrame, ScreencastOptions, ScreencastPage, TargetId,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::follow::{FollowDecision, TabFollow};
use crate::stats::Counters;

/// Item carried by the ordering queue.
#[derive(Debug)]
pub(crate) enum QueueItem {
    /// A captured frame.
    Frame(FrameEvent),
    /// Completed once everything queued before it has been processed.
    Barrier(oneshot::Sender<()>),
}

/// Why the adapter loop ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SourceExit {
    /// Cancelled by the session.
    Cancelled,
    /// The pipeline went away.
    QueueClosed,
    /// The page stopped delivering events and the session was then
    /// stopped.
    PageClosed,
}

pub(crate) struct FrameSource {
    page: Arc<dyn ScreencastPage>,
    screencast: ScreencastOptions,
    follow: TabFollow,
    queue: mpsc::Sender<QueueItem>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl FrameSource {
    pub(crate) fn new(
        page: Arc<dyn ScreencastPage>,
        screencast: ScreencastOptions,
        follow: TabFollow,
        queue: mpsc::Sender<QueueItem>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            page,
            screencast,
            follow,
            queue,
            counters,
            cancel,
        }
    }

    /// Start the screencast of the current target.
    pub(crate) async fn subscribe(&self) -> Result<()> {
        let target = self.follow.current().clone();
        self.page.start_screencast(&target, &self.screencast).await
    }

    /// Stop the screencast of the current target. Unacknowledged frames are
    /// left behind.
    async fn unsubscribe(&self, target: &TargetId) {
        if let Err(e) = self.page.stop_screencast(target).await {
            debug!(target_id = %target, error = %e, "stop screencast failed");
        }
    }

    /// Pump events until cancelled, the pipeline closes or the page goes away.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<PageEvent>) -> SourceExit {
        let exit = loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break SourceExit::Cancelled,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                // Keep the queue open so the encoder stays alive until stop.
                warn!("page event stream closed, waiting for stop");
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = self.queue.closed() => {}
                }
                break SourceExit::PageClosed;
            };
            let step = match event {
                PageEvent::Frame(frame) => self.on_frame(frame).await,
                PageEvent::TargetCreated { target_id, .. } => {
                    let decision = self.follow.on_target_created(target_id);
                    self.apply(decision).await
                }
                PageEvent::TargetDestroyed { target_id } => {
                    let decision = self.follow.on_target_destroyed(&target_id);
                    self.apply(decision).await
                }
                PageEvent::Navigated {
                    target_id,
                    screencast_ended,
                    ..
                } => {
                    let decision = self.follow.on_navigated(&target_id, screencast_ended);
                    self.apply(decision).await
                }
            };
            if let Err(exit) = step {
                break exit;
            }
        };

        if self.follow.is_current_alive() {
            let current = self.follow.current().clone();
            self.unsubscribe(&current).await;
        }
        debug!(?exit, "frame source stopped");
        exit
    }

    async fn on_frame(&self, frame: ScreencastFrame) -> std::result::Result<(), SourceExit> {
        self.counters.received();
        if frame.target_id != *self.follow.current() {
            debug!(target_id = %frame.target_id, "ignoring frame from inactive target");
            return Ok(());
        }

        let raw = match base64::engine::general_purpose::STANDARD.decode(frame.data.as_bytes()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target_id = %frame.target_id, error = %e, "dropping frame with invalid base64 payload");
                self.counters.dropped();
                self.ack(&frame).await;
                return Ok(());
            }
        };
        let (raw_width, raw_height) = frame.metadata.device_size();
        let event = FrameEvent {
            target_id: frame.target_id.clone(),
            capture_timestamp_ms: frame.metadata.timestamp_ms().unwrap_or_else(now_ms),
            raw_image: Bytes::from(raw),
            raw_width,
            raw_height,
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SourceExit::Cancelled),
            sent = self.queue.send(QueueItem::Frame(event)) => {
                if sent.is_err() {
                    return Err(SourceExit::QueueClosed);
                }
            }
        }
        self.counters.admitted();
        self.ack(&frame).await;
        Ok(())
    }

    async fn ack(&self, frame: &ScreencastFrame) {
        if let Err(e) = self.page.ack_frame(&frame.target_id, frame.ack_id).await {
            debug!(target_id = %frame.target_id, error = %e, "frame ack failed");
        }
    }

    async fn apply(&mut self, decision: FollowDecision) -> std::result::Result<(), SourceExit> {
        match decision {
            FollowDecision::Stay => {}
            FollowDecision::SwitchTo(next) => self.switch_to(next).await?,
            FollowDecision::Resubscribe => {
                let current = self.follow.current().clone();
                info!(target_id = %current, "screencast ended by navigation, resubscribing");
                self.unsubscribe(&current).await;
                if let Err(e) = self.subscribe().await {
                    warn!(target_id = %current, error = %e, "resubscribe failed");
                }
            }
            FollowDecision::Lost => {
                let current = self.follow.current();
                warn!(target_id = %current, "recorded tab closed, waiting for stop");
            }
        }
        Ok(())
    }

    /// Drain the old target's frames, then move the screencast.
    async fn switch_to(&mut self, next: TargetId) -> std::result::Result<(), SourceExit> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SourceExit::Cancelled),
            sent = self.queue.send(QueueItem::Barrier(done_tx)) => {
                if sent.is_err() {
                    return Err(SourceExit::QueueClosed);
                }
            }
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SourceExit::Cancelled),
            drained = done_rx => {
                if drained.is_err() {
                    return Err(SourceExit::QueueClosed);
                }
            }
        }

        info!(target_id = %next, "following new tab");
        if let Err(e) = self.page.start_screencast(&next, &self.screencast).await {
            warn!(target_id = %next, error = %e, "failed to start screencast on new tab");
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
