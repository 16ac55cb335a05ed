//! Browser-specific error types.

use pagereel_core::RecorderError;
use thiserror::Error;

/// Errors from the CDP client.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Failed to launch the Chrome browser process.
    #[error("failed to launch browser: {context}")]
    LaunchFailed {
        /// What went wrong during launch.
        context: String,
    },

    /// Navigation to a URL failed.
    #[error("navigation failed for {url}: {reason}")]
    NavigationFailed {
        /// The URL that failed to load.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// Screencast operations failed.
    #[error("screencast failed: {0}")]
    ScreencastFailed(String),

    /// The target is closed or was never attached.
    #[error("no attached target '{target_id}'")]
    TargetNotFound {
        /// The missing target ID.
        target_id: String,
    },

    /// Chrome executable not found on the system.
    #[error("Chrome not found, install Chrome/Chromium or set CHROME_PATH")]
    ChromeNotFound,

    /// Operation timed out.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout {
        /// How long we waited.
        timeout_ms: u64,
        /// What we were waiting for.
        context: String,
    },

    /// CDP protocol error.
    #[error("CDP error: {0}")]
    Cdp(String),
}

impl From<BrowserError> for RecorderError {
    fn from(err: BrowserError) -> Self {
        RecorderError::Browser(err.to_string())
    }
}
