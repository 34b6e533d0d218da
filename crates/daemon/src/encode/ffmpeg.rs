//! ffmpeg hardware HEVC encoder.
//!
//! Builds NVENC/AMF invocations, streams stderr for `time=` markers and
//! classifies failures.

use super::{ensure_mp4, select_strategy, EncodeError, EncodeJob, GpuStrategy, ProgressFn, Transcoder};
use crate::bus::Progress;
use crate::hardware::HardwareProbe;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of trailing stderr lines kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// Encoder knobs that do not change per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Constant-quality value (CQ for NVENC, QP for AMF).
    pub quality: u8,
    pub nvidia_preset: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            quality: 23,
            nvidia_preset: "p7".to_string(),
        }
    }
}

fn vendor_args(strategy: GpuStrategy, settings: &EncoderSettings) -> Vec<String> {
    let q = settings.quality.to_string();
    let args: Vec<&str> = match strategy {
        GpuStrategy::Nvenc => vec![
            "-c:v", "hevc_nvenc",
            "-preset", settings.nvidia_preset.as_str(),
            "-rc", "vbr",
            "-cq", q.as_str(),
            "-rc-lookahead", "32",
            "-spatial-aq", "1",
            "-temporal-aq", "1",
            "-gpu", "0",
        ],
        GpuStrategy::Amf => vec![
            "-c:v", "hevc_amf",
            "-rc", "cqp",
            "-qp_i", q.as_str(),
            "-qp_p", q.as_str(),
            "-pix_fmt", "yuv420p",
        ],
    };
    args.into_iter().map(String::from).collect()
}

/// Build an ffmpeg command for `job`.
///
/// The first video stream is re-encoded on the GPU; audio is copied and
/// subtitles are converted to `mov_text` so they survive the mp4 container.
///
/// # Errors
/// `UnsupportedContainer` when the output does not end in `.mp4`.
pub fn build_ffmpeg_command(
    binary: &str,
    strategy: GpuStrategy,
    job: &EncodeJob,
    settings: &EncoderSettings,
) -> Result<Command, EncodeError> {
    ensure_mp4(&job.output)?;

    let mut cmd = Command::new(binary);
    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(&job.input);

    cmd.args(["-map", "0:v:0", "-map", "0:a?"]);
    if job.has_subtitles {
        cmd.args(["-map", "0:s?"]);
    }

    cmd.args(vendor_args(strategy, settings));
    cmd.args(["-tag:v", "hvc1", "-c:a", "copy"]);
    if job.has_subtitles {
        cmd.args(["-c:s", "mov_text"]);
    }

    cmd.arg(&job.output);
    Ok(cmd)
}

fn time_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(-?\d+):(\d{2}):(\d{2}(?:\.\d+)?)").ok())
        .as_ref()
}

/// Elapsed seconds from an ffmpeg stats line, if it carries a parsable `time=`.
pub fn parse_progress_time(line: &str) -> Option<f64> {
    let caps = time_regex()?.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total >= 0.0).then_some(total)
}

/// Progress update for a stats line, or `None` for lines without `time=`.
pub fn progress_from_line(line: &str, duration_secs: Option<f64>) -> Option<Progress> {
    if !line.contains("time=") {
        return None;
    }
    let progress = match (parse_progress_time(line), duration_secs) {
        (Some(elapsed), Some(duration)) if duration > 0.0 => {
            Progress::Percent(((elapsed / duration) * 100.0).clamp(0.0, 100.0) as f32)
        }
        _ => Progress::Indeterminate,
    };
    Some(progress)
}

fn gpu_error_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)error initializing|cannot load|no capable devices|openencodesessionex failed|unknown encoder|\bno (nvenc|amf|cuda|gpu)\b|(nvenc|amf|cuda|gpu).*(error|fail|cannot|unsupported|unavailable|not (found|available|supported))",
        )
        .ok()
    })
    .as_ref()
}

/// Stream metadata such as `    encoder         : Lavf60.16.100`.
fn metadata_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+[\w-]+\s*: ").ok()).as_ref()
}

/// Whether a stderr line reports that the hardware encoder could not run.
fn is_gpu_error_line(line: &str) -> bool {
    if metadata_regex().is_some_and(|re| re.is_match(line)) {
        return false;
    }
    gpu_error_regex().is_some_and(|re| re.is_match(line))
}

/// Maps a failed exit to a GPU-capability failure or a generic one.
pub fn classify_failure(code: Option<i32>, tail: &str) -> EncodeError {
    if tail.lines().any(is_gpu_error_line) {
        EncodeError::GpuCapability(tail.to_string())
    } else {
        EncodeError::Failed {
            code,
            tail: tail.to_string(),
        }
    }
}

/// Encoder backed by the `ffmpeg` binary.
pub struct FfmpegTranscoder {
    binary: String,
    hardware: Arc<dyn HardwareProbe>,
    force_cpu: bool,
    settings: EncoderSettings,
}

impl FfmpegTranscoder {
    pub fn new(hardware: Arc<dyn HardwareProbe>, force_cpu: bool, settings: EncoderSettings) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            hardware,
            force_cpu,
            settings,
        }
    }

    async fn run(
        &self,
        cmd: Command,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EncodeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ffmpeg stderr not captured",
            ))
        })?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let work = async {
            // ffmpeg terminates stats lines with '\r'.
            let mut segments = BufReader::new(stderr).split(b'\r');
            while let Some(segment) = segments.next_segment().await? {
                let text = String::from_utf8_lossy(&segment);
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    debug!(target: "squeeze_daemon::encode", "{}", line);
                    if let Some(progress) = progress_from_line(line, job.duration_secs) {
                        on_progress(progress);
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            child.wait().await
        };

        let outcome: Option<std::io::Result<ExitStatus>> = tokio::select! {
            status = work => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match outcome {
            Some(status) => status?,
            None => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill ffmpeg");
                }
                return Err(EncodeError::Cancelled);
            }
        };

        if status.success() {
            return Ok(());
        }
        let tail = tail.into_iter().collect::<Vec<_>>().join("\n");
        Err(classify_failure(status.code(), &tail))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn encode(
        &self,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        let vendor = self.hardware.detect();
        let strategy = select_strategy(vendor, self.force_cpu)?;
        let cmd = build_ffmpeg_command(&self.binary, strategy, job, &self.settings)?;

        info!(
            input = %job.input.display(),
            output = %job.output.display(),
            ?strategy,
            "Starting encode"
        );
        on_progress(Progress::Indeterminate);
        self.run(cmd, job, on_progress, cancel).await
    }
}
