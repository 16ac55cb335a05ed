//! Normalize and encode stage: drains the ordering queue into the encoder.

use std::sync::Arc;

use pagereel_core::{FrameEvent, RecorderError, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::encoder::{EncoderPipe, ExitInfo, ExitResult, failure};
use crate::normalize::Normalizer;
use crate::pacing::FramePacer;
use crate::source::QueueItem;
use crate::stats::Counters;

pub(crate) struct Pipeline {
    normalizer: Normalizer,
    pacer: FramePacer,
    encoder: EncoderPipe,
    counters: Arc<Counters>,
}

impl Pipeline {
    pub(crate) fn new(
        normalizer: Normalizer,
        pacer: FramePacer,
        encoder: EncoderPipe,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            normalizer,
            pacer,
            encoder,
            counters,
        }
    }

    /// Process queue items in order until the queue closes, then finalize
    /// the encoder.
    ///
    /// Returns early with `EncoderFailure` if the encoder exits or rejects
    /// a write before the queue closes.
    pub(crate) async fn run(mut self, mut queue: mpsc::Receiver<QueueItem>) -> Result<ExitResult> {
        let mut exit = self.encoder.exit_watch();
        loop {
            let item = tokio::select! {
                biased;
                exited = exit.wait_for(Option::is_some) => {
                    let info = exited.ok().and_then(|guard| guard.clone());
                    return Err(unexpected_exit(info));
                }
                item = queue.recv() => item,
            };
            match item {
                Some(QueueItem::Frame(frame)) => self.process(&frame).await?,
                Some(QueueItem::Barrier(done)) => {
                    let _ = done.send(());
                }
                None => break,
            }
        }

        if let Some(last) = self.pacer.finish() {
            self.encoder.write_frame(&last).await?;
            self.counters.encoded();
        }
        self.encoder.close().await
    }

    async fn process(&mut self, frame: &FrameEvent) -> Result<()> {
        let normalized = match self.normalizer.normalize(frame) {
            Ok(normalized) => normalized,
            Err(e) if !e.is_fatal() => {
                warn!(target_id = %frame.target_id, error = %e, "dropping undecodable frame");
                self.counters.dropped();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.counters.normalized();
        debug!(
            target_id = %frame.target_id,
            sequence = normalized.sequence,
            "frame normalized"
        );

        if let Some((ready, repeats)) = self.pacer.push(normalized) {
            for _ in 0..repeats {
                self.encoder.write_frame(&ready).await?;
                self.counters.encoded();
            }
        }
        Ok(())
    }
}

fn unexpected_exit(info: Option<ExitInfo>) -> RecorderError {
    let message = match info.as_ref().and_then(|i| i.exit_code) {
        Some(code) => format!("encoder exited unexpectedly with code {code}"),
        None => "encoder terminated unexpectedly".to_string(),
    };
    failure(message, info)
}
