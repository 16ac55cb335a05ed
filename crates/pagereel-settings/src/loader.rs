//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PagereelSettings::default()`]
//! 2. If `~/.pagereel/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PAGEREEL_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use pagereel_core::options::{AspectRatio, MAX_DIMENSION, MAX_FRAME_RATE, OutputFormat};
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::PagereelSettings;

/// Resolve the path to the settings file (`~/.pagereel/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pagereel").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PagereelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or invalid values, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<PagereelSettings> {
    let defaults = serde_json::to_value(PagereelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PagereelSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut PagereelSettings) {
    // ── Recorder ────────────────────────────────────────────────────
    if let Some(v) = read_env_u32("PAGEREEL_FPS", 1, MAX_FRAME_RATE) {
        settings.recorder.fps = v;
    }
    if let Some(v) = read_env_bool("PAGEREEL_FOLLOW_NEW_TAB") {
        settings.recorder.follow_new_tab = v;
    }
    if let Some(v) = read_env_u32("PAGEREEL_WIDTH", 2, MAX_DIMENSION) {
        settings.recorder.width = Some(v);
    }
    if let Some(v) = read_env_u32("PAGEREEL_HEIGHT", 2, MAX_DIMENSION) {
        settings.recorder.height = Some(v);
    }
    if let Some(v) = read_env_parsed::<AspectRatio>("PAGEREEL_ASPECT_RATIO") {
        settings.recorder.aspect_ratio = Some(v);
    }
    if let Some(v) = read_env_parsed::<OutputFormat>("PAGEREEL_FORMAT") {
        settings.recorder.format = v;
    }
    if let Some(v) = read_env_usize("PAGEREEL_QUEUE_CAPACITY", 1, 1024) {
        settings.recorder.queue_capacity = v;
    }
    if let Some(v) = read_env_u64("PAGEREEL_STOP_TIMEOUT_MS", 100, 3_600_000) {
        settings.recorder.stop_timeout_ms = v;
    }
    if let Some(v) = read_env_string("PAGEREEL_BACKGROUND_COLOR") {
        settings.recorder.background_color = v;
    }

    // ── Encoder ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PAGEREEL_FFMPEG_PATH") {
        settings.encoder.ffmpeg_path = v;
    }
    if let Some(v) = read_env_string("PAGEREEL_VIDEO_CODEC") {
        settings.encoder.video_codec = Some(v);
    }
    if let Some(v) = read_env_string("PAGEREEL_PRESET") {
        settings.encoder.preset = v;
    }

    // ── Screencast ──────────────────────────────────────────────────
    if let Some(v) = read_env_u32("PAGEREEL_SCREENCAST_QUALITY", 0, 100) {
        settings.screencast.quality = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PAGEREEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = read_env_string(name)?;
    let result = val.parse().ok();
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
