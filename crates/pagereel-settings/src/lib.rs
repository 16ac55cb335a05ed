//! # pagereel-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`PagereelSettings::default()`]
//! 2. **User file**: `~/.pagereel/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PAGEREEL_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use pagereel_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("recording at {} fps", settings.recorder.fps);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<PagereelSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.pagereel/settings.json` with env
/// var overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static PagereelSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            PagereelSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: PagereelSettings) -> std::result::Result<(), PagereelSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = PagereelSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = PagereelSettings::default();
        assert_eq!(settings.version, "0.1.0");
        assert_eq!(settings.recorder.fps, 25);
        assert!(settings.recorder.follow_new_tab);
        assert_eq!(settings.recorder.queue_capacity, 4);
        assert_eq!(settings.recorder.stop_timeout_ms, 30_000);
        assert_eq!(settings.encoder.ffmpeg_path, "ffmpeg");
        assert_eq!(settings.screencast.quality, 80);
        assert_eq!(settings.logging.level, "warn");
        assert!(settings.validate().is_ok());
    }
}
