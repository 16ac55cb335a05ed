//! Frame counters shared by the pipeline stages.
//!
//! Each increment is also reported to the installed `metrics` recorder as
//! [`RECORDER_FRAMES_TOTAL`] labelled by stage.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

/// Frames seen per pipeline stage (counter, labels: stage).
pub const RECORDER_FRAMES_TOTAL: &str = "recorder_frames_total";

/// Point-in-time view of a session's frame counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStats {
    /// Frame notifications received from the browser.
    pub frames_received: u64,
    /// Frames admitted into the ordering queue (and acknowledged).
    pub frames_admitted: u64,
    /// Frames normalized; equals the next sequence number.
    pub frames_normalized: u64,
    /// Frames dropped because they could not be decoded.
    pub frames_dropped: u64,
    /// Frames written to the encoder, counting paced repeats.
    pub frames_encoded: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    received: AtomicU64,
    admitted: AtomicU64,
    normalized: AtomicU64,
    dropped: AtomicU64,
    encoded: AtomicU64,
}

impl Counters {
    pub(crate) fn received(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDER_FRAMES_TOTAL, "stage" => "received").increment(1);
    }

    pub(crate) fn admitted(&self) {
        let _ = self.admitted.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDER_FRAMES_TOTAL, "stage" => "admitted").increment(1);
    }

    pub(crate) fn normalized(&self) {
        let _ = self.normalized.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDER_FRAMES_TOTAL, "stage" => "normalized").increment(1);
    }

    pub(crate) fn dropped(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDER_FRAMES_TOTAL, "stage" => "dropped").increment(1);
    }

    pub(crate) fn encoded(&self) {
        let _ = self.encoded.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDER_FRAMES_TOTAL, "stage" => "encoded").increment(1);
    }

    pub(crate) fn snapshot(&self) -> RecordingStats {
        RecordingStats {
            frames_received: self.received.load(Ordering::Relaxed),
            frames_admitted: self.admitted.load(Ordering::Relaxed),
            frames_normalized: self.normalized.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_encoded: self.encoded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn snapshot_reflects_counts() {
        let counters = Counters::default();
        counters.received();
        counters.received();
        counters.admitted();
        counters.normalized();
        counters.dropped();
        counters.encoded();
        counters.encoded();
        assert_eq!(
            counters.snapshot(),
            RecordingStats {
                frames_received: 2,
                frames_admitted: 1,
                frames_normalized: 1,
                frames_dropped: 1,
                frames_encoded: 2,
            }
        );
    }

    /// Sums counter increments by `stage` label.
    #[derive(Default)]
    struct StageRecorder {
        counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    }

    impl StageRecorder {
        fn total(&self, stage: &str) -> u64 {
            self.counters
                .lock()
                .get(stage)
                .map_or(0, |c| c.load(Ordering::Relaxed))
        }
    }

    impl Recorder for StageRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            assert_eq!(key.name(), RECORDER_FRAMES_TOTAL);
            let stage = key
                .labels()
                .find(|l| l.key() == "stage")
                .map(|l| l.value().to_owned())
                .unwrap_or_default();
            let counter = Arc::clone(self.counters.lock().entry(stage).or_default());
            Counter::from_arc(counter)
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn increments_are_reported_per_stage() {
        let recorder = StageRecorder::default();
        let counters = Counters::default();
        metrics::with_local_recorder(&recorder, || {
            counters.received();
            counters.received();
            counters.received();
            counters.admitted();
            counters.admitted();
            counters.dropped();
            counters.normalized();
            counters.encoded();
            counters.encoded();
        });

        let snapshot = counters.snapshot();
        assert_eq!(recorder.total("received"), snapshot.frames_received);
        assert_eq!(recorder.total("admitted"), 2);
        assert_eq!(recorder.total("normalized"), 1);
        assert_eq!(recorder.total("dropped"), 1);
        assert_eq!(recorder.total("encoded"), 2);
    }

    #[test]
    fn stats_serialize_camel_case() {
        let json = serde_json::to_value(RecordingStats::default()).unwrap();
        assert_eq!(json["framesEncoded"], 0);
        assert_eq!(json["framesDropped"], 0);
    }
}
