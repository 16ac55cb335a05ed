//! Recording duration formatting (`HH:MM:SS:CC`).

use std::fmt;
use std::time::Duration;

/// Wall-clock length of a recording.
///
/// Displays as `hours:minutes:seconds:centiseconds`, each field zero-padded
/// to two digits (hours grow past two digits if needed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordDuration(Duration);

impl RecordDuration {
    /// The zero duration, `00:00:00:00`.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Wrap a [`Duration`].
    #[must_use]
    pub fn new(elapsed: Duration) -> Self {
        Self(elapsed)
    }

    /// The wrapped duration.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Whether no time has elapsed (at centisecond resolution).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.as_millis() < 10
    }
}

impl From<Duration> for RecordDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl fmt::Display for RecordDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.0.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;
        let centis = self.0.subsec_millis() / 10;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02}:{centis:02}")
    }
}
