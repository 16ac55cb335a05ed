//! Encoder subprocess: raw RGBA frames in over stdin, a container file out.
//!
//! [`EncoderCommand`] builds the process; [`Ffmpeg`] is the production
//! implementation. [`EncoderPipe`] owns the running process through a
//! watcher task that keeps a tail of stderr and publishes the exit status,
//! so an encoder that dies mid-recording is noticed without waiting for the
//! next write.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use pagereel_core::{NormalizedFrame, OutputFormat, RecorderError, Result};
use pagereel_settings::EncoderSettings;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a failed write waits for the exit status before reporting.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long stderr is drained after exit. Grandchildren may keep it open.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// What the encoder is asked to produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeParams {
    /// Container file to write.
    pub output_path: PathBuf,
    /// Nominal input frame rate.
    pub frame_rate: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Container format.
    pub format: OutputFormat,
}

/// Builds the encoder process for a set of parameters.
pub trait EncoderCommand: Send + Sync {
    /// Program name, for error reports.
    fn program(&self) -> &str;

    /// Command reading raw RGBA frames of `params` geometry from stdin.
    ///
    /// Stdio is configured by the caller.
    fn command(&self, params: &EncodeParams) -> Command;
}

/// ffmpeg reading `rawvideo` RGBA from `pipe:0`.
#[derive(Clone, Debug)]
pub struct Ffmpeg {
    /// Binary path or name.
    pub path: String,
    /// Codec override; defaults per format.
    pub video_codec: Option<String>,
    /// x264 preset.
    pub preset: String,
    /// Constant rate factor.
    pub crf: u8,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::from_settings(&EncoderSettings::default())
    }
}

impl Ffmpeg {
    /// Build from encoder settings.
    pub fn from_settings(settings: &EncoderSettings) -> Self {
        Self {
            path: settings.ffmpeg_path.clone(),
            video_codec: settings.video_codec.clone(),
            preset: settings.preset.clone(),
            crf: settings.crf,
        }
    }

    /// Full argument list.
    pub fn args(&self, params: &EncodeParams) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
        ]
        .map(String::from)
        .to_vec();
        args.extend([
            "-s".to_string(),
            format!("{}x{}", params.width, params.height),
            "-framerate".to_string(),
            params.frame_rate.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ]);

        match params.format {
            OutputFormat::Mp4 => {
                let codec = self.video_codec.as_deref().unwrap_or("libx264");
                args.extend(["-c:v".to_string(), codec.to_string()]);
                if codec == "libx264" {
                    args.extend(["-preset".to_string(), self.preset.clone()]);
                }
                args.extend([
                    "-crf".to_string(),
                    self.crf.to_string(),
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                    "-movflags".to_string(),
                    "+faststart".to_string(),
                ]);
            }
            OutputFormat::Webm => {
                let codec = self.video_codec.as_deref().unwrap_or("libvpx-vp9");
                args.extend([
                    "-c:v".to_string(),
                    codec.to_string(),
                    "-crf".to_string(),
                    self.crf.to_string(),
                    "-b:v".to_string(),
                    "0".to_string(),
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                ]);
            }
        }

        args.extend([
            "-r".to_string(),
            params.frame_rate.to_string(),
            "-y".to_string(),
            params.output_path.display().to_string(),
        ]);
        args
    }
}

impl EncoderCommand for Ffmpeg {
    fn program(&self) -> &str {
        &self.path
    }

    fn command(&self, params: &EncodeParams) -> Command {
        let mut cmd = Command::new(&self.path);
        let _ = cmd.args(self.args(params));
        cmd
    }
}

/// How the encoder process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Last lines of stderr.
    pub stderr_tail: String,
}

/// Result of a successful [`EncoderPipe::close`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitResult {
    /// Frames written to the encoder's stdin.
    pub frames_written: u64,
    /// Size of the output file.
    pub output_bytes: u64,
    /// Last lines of stderr (warnings, if any).
    pub stderr_tail: String,
}

/// A running encoder process.
pub struct EncoderPipe {
    params: EncodeParams,
    program: String,
    stdin: Option<ChildStdin>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill: CancellationToken,
    _watcher: JoinHandle<()>,
    frames_written: u64,
}

impl fmt::Debug for EncoderPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderPipe")
            .field("program", &self.program)
            .field("params", &self.params)
            .field("frames_written", &self.frames_written)
            .field("stdin_open", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

impl EncoderPipe {
    /// Spawn the encoder for `params`.
    ///
    /// Creates the output's parent directory if needed.
    pub async fn open(
        command: &dyn EncoderCommand,
        params: EncodeParams,
        stderr_tail_lines: usize,
    ) -> Result<Self> {
        if let Some(parent) = params.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = command.command(&params);
        let _ = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a Ctrl-C aimed at us must not kill the encoder
        // before it finalizes the container.
        #[cfg(unix)]
        let _ = cmd.process_group(0);

        let program = command.program().to_string();
        let mut child = cmd
            .spawn()
            .map_err(|e| RecorderError::SubprocessSpawnFailure {
                program: program.clone(),
                reason: e.to_string(),
            })?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        debug!(
            program = %program,
            output_path = %params.output_path.display(),
            width = params.width,
            height = params.height,
            fps = params.frame_rate,
            "encoder spawned"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let watcher = tokio::spawn(watch_process(
            child,
            stderr,
            stderr_tail_lines.max(1),
            kill.clone(),
            exit_tx,
        ));

        Ok(Self {
            params,
            program,
            stdin,
            exit_rx,
            kill,
            _watcher: watcher,
            frames_written: 0,
        })
    }

    /// Parameters the encoder was opened with.
    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Receiver that turns `Some` when the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Token that kills the process when cancelled.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Write one frame. Waits while the process's input pipe is full.
    pub async fn write_frame(&mut self, frame: &NormalizedFrame) -> Result<()> {
        if (frame.width, frame.height) != (self.params.width, self.params.height)
            || !frame.is_well_formed()
        {
            return Err(RecorderError::invalid_argument(format!(
                "frame {} is {}x{} ({} bytes), encoder expects {}x{}",
                frame.sequence,
                frame.width,
                frame.height,
                frame.pixels.len(),
                self.params.width,
                self.params.height
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(RecorderError::InvalidState {
                state: "encoder input closed".into(),
            });
        };
        if let Err(e) = stdin.write_all(&frame.pixels).await {
            let info = self.wait_exit(EXIT_GRACE).await;
            return Err(failure(
                format!("writing frame {} failed: {e}", frame.sequence),
                info,
            ));
        }
        self.frames_written += 1;
        Ok(())
    }

    /// Signal end of input, wait for the process and classify the result.
    ///
    /// Success means exit code 0 and a non-empty output file.
    pub async fn close(mut self) -> Result<ExitResult> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let mut rx = self.exit_rx.clone();
        let info = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or(ExitInfo {
                exit_code: None,
                stderr_tail: String::new(),
            });

        if info.exit_code != Some(0) {
            let message = match info.exit_code {
                Some(code) => format!("{} exited with code {code}", self.program),
                None => format!("{} was terminated by a signal", self.program),
            };
            return Err(failure(message, Some(info)));
        }

        let output_bytes = output_size(&self.params.output_path).await;
        if output_bytes == 0 {
            return Err(failure(
                format!("{} produced no output", self.params.output_path.display()),
                Some(info),
            ));
        }

        debug!(
            output_path = %self.params.output_path.display(),
            frames = self.frames_written,
            bytes = output_bytes,
            "encoder finished"
        );
        Ok(ExitResult {
            frames_written: self.frames_written,
            output_bytes,
            stderr_tail: info.stderr_tail,
        })
    }

    async fn wait_exit(&self, grace: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(grace, rx.wait_for(Option::is_some)).await {
            Ok(Ok(guard)) => guard.clone(),
            _ => None,
        }
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        // Closed pipes have already been reaped; anything else is killed.
        if self.exit_rx.borrow().is_none() {
            self.kill.cancel();
        }
    }
}

/// Build an [`RecorderError::EncoderFailure`] from what is known of the exit.
pub(crate) fn failure(message: String, info: Option<ExitInfo>) -> RecorderError {
    let (exit_code, stderr_tail) = info.map_or((None, String::new()), |i| (i.exit_code, i.stderr_tail));
    RecorderError::EncoderFailure {
        message,
        exit_code,
        stderr_tail,
    }
}

async fn output_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |m| m.len())
}

/// Own the child: collect the stderr tail, kill on request, publish exit.
async fn watch_process(
    mut child: tokio::process::Child,
    stderr: Option<ChildStderr>,
    tail_lines: usize,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let tail = Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(tail_lines)));
    let reader = stderr.map(|stderr| tokio::spawn(collect_tail(stderr, tail_lines, Arc::clone(&tail))));

    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            warn!("killing encoder");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    if let Some(mut reader) = reader {
        if tokio::time::timeout(STDERR_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }
    let stderr_tail = tail.lock().iter().cloned().collect::<Vec<String>>().join("\n");
    let exit_code = status.ok().and_then(|s| s.code());
    debug!(?exit_code, "encoder exited");
    let _ = exit_tx.send(Some(ExitInfo {
        exit_code,
        stderr_tail,
    }));
}

async fn collect_tail(
    stderr: ChildStderr,
    tail_lines: usize,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut tail = tail.lock();
        if tail.len() == tail_lines {
            let _ = tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ShellEncoder, solid_frame};
    use assert_matches::assert_matches;

    fn params(dir: &Path, name: &str) -> EncodeParams {
        EncodeParams {
            output_path: dir.join(name),
            frame_rate: 25,
            width: 4,
            height: 2,
            format: OutputFormat::Mp4,
        }
    }

    #[test]
    fn ffmpeg_mp4_args() {
        let p = EncodeParams {
            output_path: PathBuf::from("/tmp/out.mp4"),
            frame_rate: 30,
            width: 1280,
            height: 720,
            format: OutputFormat::Mp4,
        };
        let args = Ffmpeg::default().args(&p);
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgba -s 1280x720 -framerate 30 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -crf 23"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn ffmpeg_webm_args() {
        let p = EncodeParams {
            output_path: PathBuf::from("clip.webm"),
            frame_rate: 25,
            width: 640,
            height: 480,
            format: OutputFormat::Webm,
        };
        let joined = Ffmpeg::default().args(&p).join(" ");
        assert!(joined.contains("-c:v libvpx-vp9"));
        assert!(!joined.contains("faststart"));
        assert!(!joined.contains("-preset"));
    }

    #[test]
    fn ffmpeg_codec_override() {
        let ffmpeg = Ffmpeg {
            video_codec: Some("h264_nvenc".into()),
            ..Ffmpeg::default()
        };
        let joined = ffmpeg
            .args(&EncodeParams {
                output_path: PathBuf::from("a.mp4"),
                frame_rate: 25,
                width: 2,
                height: 2,
                format: OutputFormat::Mp4,
            })
            .join(" ");
        assert!(joined.contains("-c:v h264_nvenc"));
        assert!(!joined.contains("-preset"));
    }

    #[tokio::test]
    async fn frames_reach_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = params(&dir.path().join("nested/deeper"), "out.mp4");
        let mut pipe = EncoderPipe::open(&ShellEncoder::cat(), p.clone(), 20).await.unwrap();
        for seq in 0..3 {
            pipe.write_frame(&solid_frame(seq, 4, 2)).await.unwrap();
        }
        let result = pipe.close().await.unwrap();
        assert_eq!(result.frames_written, 3);
        assert_eq!(result.output_bytes, 3 * 4 * 2 * 4);
        assert!(p.output_path.exists());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = ShellEncoder::new("echo 'first line' >&2; echo 'Unknown encoder libx264' >&2; exit 3");
        let pipe = EncoderPipe::open(&encoder, params(dir.path(), "out.mp4"), 1).await.unwrap();
        let err = pipe.close().await.unwrap_err();
        assert_matches!(
            err,
            RecorderError::EncoderFailure { exit_code: Some(3), ref stderr_tail, .. }
                if stderr_tail == "Unknown encoder libx264"
        );
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = EncoderPipe::open(&ShellEncoder::cat(), params(dir.path(), "out.mp4"), 20)
            .await
            .unwrap();
        let err = pipe.close().await.unwrap_err();
        assert_matches!(err, RecorderError::EncoderFailure { exit_code: Some(0), .. });
        assert!(err.to_string().contains("no output"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = Ffmpeg {
            path: "/nonexistent/ffmpeg".into(),
            ..Ffmpeg::default()
        };
        let result = EncoderPipe::open(&ffmpeg, params(dir.path(), "out.mp4"), 20).await;
        assert_matches!(
            result,
            Err(RecorderError::SubprocessSpawnFailure { ref program, .. }) if program == "/nonexistent/ffmpeg"
        );
    }

    #[tokio::test]
    async fn wrong_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = EncoderPipe::open(&ShellEncoder::cat(), params(dir.path(), "out.mp4"), 20)
            .await
            .unwrap();
        let err = pipe.write_frame(&solid_frame(0, 2, 2)).await.unwrap_err();
        assert_matches!(err, RecorderError::InvalidArgument { .. });
        assert_eq!(pipe.frames_written(), 0);
    }

    #[tokio::test]
    async fn early_exit_is_observable_and_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = ShellEncoder::new("echo 'broken' >&2; exit 1");
        let mut pipe = EncoderPipe::open(&encoder, params(dir.path(), "out.mp4"), 20).await.unwrap();

        let mut exit = pipe.exit_watch();
        let info = exit.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert_eq!(info.exit_code, Some(1));

        // Large enough to overflow the pipe buffer of a process that is gone.
        let mut result = Ok(());
        for seq in 0..64 {
            result = pipe.write_frame(&solid_frame(seq, 4, 2)).await;
            if result.is_err() {
                break;
            }
        }
        assert_matches!(result, Err(RecorderError::EncoderFailure { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn kill_switch_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = ShellEncoder::new("exec sleep 30");
        let pipe = EncoderPipe::open(&encoder, params(dir.path(), "out.mp4"), 20).await.unwrap();
        let mut exit = pipe.exit_watch();
        pipe.kill_switch().cancel();
        let info = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(info.exit_code, None);
    }
}
