//! # pagereel
//!
//! Command-line recorder: launches Chrome, opens a URL and records the page
//! into a video file until a time limit or Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pagereel_cdp::{BrowserSession, LaunchOptions, resolve_chrome};
use pagereel_core::{AspectRatio, OutputFormat, RecordingOptions, VideoFrame};
use pagereel_recorder::{PageRecorder, RecorderConfig};
use pagereel_settings::PagereelSettings;

/// Record web pages to video.
#[derive(Parser, Debug)]
#[command(name = "pagereel", version, about = "Record a web page to video")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a page until the time limit or Ctrl-C.
    Record(RecordArgs),
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Page to open.
    url: String,

    /// Output file (`.mp4` or `.webm`).
    #[arg(short, long)]
    output: PathBuf,

    /// Stop after this many seconds (default: wait for Ctrl-C).
    #[arg(long)]
    seconds: Option<u64>,

    /// Output frame rate (overrides settings).
    #[arg(long)]
    fps: Option<u32>,

    /// Canvas width; requires `--height`.
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Canvas height; requires `--width`.
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Canvas aspect ratio as `W:H`, used without an explicit size.
    #[arg(long)]
    aspect_ratio: Option<AspectRatio>,

    /// Keep recording the original tab when the page opens a new one.
    #[arg(long)]
    no_follow_new_tab: bool,

    /// Chrome binary (default: `CHROME_PATH` or a well-known location).
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Show the browser window.
    #[arg(long)]
    headful: bool,

    /// Log level filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl RecordArgs {
    /// Layer the flags over the configured defaults.
    fn recording_options(&self, defaults: &RecordingOptions) -> Result<RecordingOptions> {
        let mut options = defaults.clone();
        if let Some(fps) = self.fps {
            options.output_frame_rate = fps;
        }
        if let (Some(width), Some(height)) = (self.width, self.height) {
            options.video_frame = Some(VideoFrame { width, height });
        }
        if let Some(ratio) = self.aspect_ratio {
            options.aspect_ratio = Some(ratio);
        }
        if self.no_follow_new_tab {
            options.follow_new_tab = false;
        }
        options.output_format = format_for(&self.output, defaults.output_format)?;
        Ok(options)
    }
}

/// Output format implied by the file extension.
fn format_for(path: &Path, fallback: OutputFormat) -> Result<OutputFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext
            .parse()
            .with_context(|| format!("cannot record to {}", path.display())),
        None => Ok(fallback),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = pagereel_settings::get_settings();
    match cli.command {
        Command::Record(args) => record(args, settings).await,
    }
}

async fn record(args: RecordArgs, settings: &PagereelSettings) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(settings.logging.level.as_str());
    if args.log_json {
        pagereel_core::logging::init_json_subscriber(level);
    } else {
        pagereel_core::logging::init_subscriber(level);
    }

    let options = args.recording_options(&settings.recorder.recording_options())?;
    let config = RecorderConfig::from_settings(settings).context("invalid recorder settings")?;

    let chrome =
        resolve_chrome(args.chrome.as_deref()).context("pass --chrome to choose a binary")?;
    let launch = LaunchOptions {
        headless: !args.headful,
        ..LaunchOptions::default()
    };
    let browser = Arc::new(
        BrowserSession::launch(&chrome, &launch)
            .await
            .with_context(|| format!("failed to launch {}", chrome.display()))?,
    );
    tracing::info!(path = %chrome.display(), "chrome launched");

    let page = browser
        .new_page(&args.url)
        .await
        .with_context(|| format!("failed to open {}", args.url))?;
    let recorder = PageRecorder::new(Arc::new(page), config);
    recorder
        .start(&args.output, Some(options))
        .await
        .context("failed to start recording")?;
    println!(
        "recording {} to {} (Ctrl-C to stop)",
        args.url,
        args.output.display()
    );

    wait_for_end(&recorder, args.seconds).await?;

    let finalized = recorder.stop().await;
    let stats = recorder.stats();
    println!(
        "duration {}  frames {} (encoded {}, dropped {})",
        recorder.get_record_duration(),
        stats.frames_normalized,
        stats.frames_encoded,
        stats.frames_dropped
    );
    if let Err(e) = browser.close().await {
        tracing::warn!(error = %e, "browser did not close cleanly");
    }

    if !finalized {
        let reason = recorder
            .last_encoder_error()
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("recording failed: {reason}");
    }
    println!("saved {}", args.output.display());
    Ok(())
}

/// Wait for the time limit, Ctrl-C or the session failing on its own.
async fn wait_for_end(recorder: &PageRecorder, seconds: Option<u64>) -> Result<()> {
    let limit = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    let ended = async {
        while !recorder.state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    };
    tokio::select! {
        () = limit => {}
        () = ended => {
            tracing::warn!(state = %recorder.state(), "recording ended early");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
        }
    }
    Ok(())
}
