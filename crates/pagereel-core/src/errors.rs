//! Recording error taxonomy.
//!
//! Argument and subprocess errors are always surfaced to the caller.
//! [`RecorderError::UnsupportedImageFormat`] is per-frame: the pipeline logs
//! and counts it, then keeps recording.

use thiserror::Error;

/// Errors produced by the capture → normalize → encode pipeline.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Bad output path, bad extension, or contradictory options. Rejected
    /// before any resource is allocated.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// A recording is already starting or running on this page.
    #[error("a recording is already active on page '{page}'")]
    AlreadyActive {
        /// Page handle that already has an active recording.
        page: String,
    },

    /// The operation is not valid in the session's current state.
    #[error("operation not valid in state {state}")]
    InvalidState {
        /// Name of the current state.
        state: String,
    },

    /// Raw frame bytes could not be decoded as an image.
    #[error("unsupported image format: {reason}")]
    UnsupportedImageFormat {
        /// Decoder message.
        reason: String,
    },

    /// The encoder subprocess failed or exited unexpectedly.
    #[error("encoder failed: {message}")]
    EncoderFailure {
        /// Summary of the failure.
        message: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Last lines of the encoder's stderr.
        stderr_tail: String,
    },

    /// The encoder subprocess could not be spawned.
    #[error("failed to spawn encoder '{program}': {reason}")]
    SubprocessSpawnFailure {
        /// Program that was being spawned.
        program: String,
        /// OS error message.
        reason: String,
    },

    /// The browser collaborator reported an error.
    #[error("browser error: {0}")]
    Browser(String),

    /// Filesystem error while preparing the output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecorderError {
    /// Shorthand for [`RecorderError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::AlreadyActive { .. } => "ALREADY_ACTIVE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::UnsupportedImageFormat { .. } => "UNSUPPORTED_IMAGE_FORMAT",
            Self::EncoderFailure { .. } => "ENCODER_FAILURE",
            Self::SubprocessSpawnFailure { .. } => "SUBPROCESS_SPAWN_FAILURE",
            Self::Browser(_) => "BROWSER_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the error ends the recording session.
    ///
    /// Only per-frame decode errors are absorbed by the pipeline.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnsupportedImageFormat { .. })
    }
}

/// Result type for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn invalid_argument_display() {
        let err = RecorderError::invalid_argument("output path should have .mp4 extension");
        assert_eq!(
            err.to_string(),
            "invalid argument: output path should have .mp4 extension"
        );
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn already_active_names_page() {
        let err = RecorderError::AlreadyActive {
            page: "page-1".into(),
        };
        assert!(err.to_string().contains("page-1"));
        assert_eq!(err.code(), "ALREADY_ACTIVE");
    }

    #[test]
    fn encoder_failure_display() {
        let err = RecorderError::EncoderFailure {
            message: "exited with code 1".into(),
            exit_code: Some(1),
            stderr_tail: "Unknown encoder 'libx264'".into(),
        };
        assert_eq!(err.to_string(), "encoder failed: exited with code 1");
        assert_eq!(err.code(), "ENCODER_FAILURE");
    }

    #[test]
    fn spawn_failure_display() {
        let err = RecorderError::SubprocessSpawnFailure {
            program: "ffmpeg".into(),
            reason: "No such file or directory".into(),
        };
        assert!(err.to_string().contains("ffmpeg"));
        assert!(err.to_string().contains("No such file"));
    }

    #[test]
    fn only_decode_errors_are_non_fatal() {
        let decode = RecorderError::UnsupportedImageFormat {
            reason: "bad magic".into(),
        };
        assert!(!decode.is_fatal());
        assert!(RecorderError::invalid_argument("x").is_fatal());
        assert!(RecorderError::Browser("gone".into()).is_fatal());
        assert!(
            RecorderError::InvalidState {
                state: "Stopped".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: RecorderError = io_err.into();
        assert_matches!(err, RecorderError::Io(_));
        assert_eq!(err.code(), "IO_ERROR");
    }
}
