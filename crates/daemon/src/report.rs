//! Side-by-side diagnostic reports for rejected encodes.
//!
//! Written as pretty JSON under `Log/reports/<stem>_report.json`.

use crate::catalog::current_timestamp_ms;
use crate::lifecycle::unique_path;
use crate::probe::MediaInfo;
use crate::validate::{Validation, Verdict};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// One column of the comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaSide {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixels: Option<u64>,
    pub fps: Option<f64>,
    pub video_bitrate_kbps: Option<f64>,
    pub audio_bitrate_kbps: Option<f64>,
    pub audio_sample_rate: Option<u32>,
}

impl MediaSide {
    pub fn new(path: &Path, size_bytes: u64, info: Option<&MediaInfo>) -> Self {
        let video = info.and_then(|i| i.video.as_ref());
        let audio = info.and_then(|i| i.audio.first());
        let width = info.and_then(MediaInfo::width);
        let height = info.and_then(MediaInfo::height);
        Self {
            path: path.to_path_buf(),
            size_bytes,
            duration_secs: info.and_then(|i| i.duration_secs),
            width,
            height,
            pixels: width.zip(height).map(|(w, h)| w as u64 * h as u64),
            fps: video.and_then(|v| v.fps),
            video_bitrate_kbps: video.and_then(|v| v.bitrate_kbps),
            audio_bitrate_kbps: audio.and_then(|a| a.bitrate_kbps),
            audio_sample_rate: audio.and_then(|a| a.sample_rate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub created_at_unix_ms: i64,
    pub verdict: Verdict,
    pub reason: String,
    pub original: MediaSide,
    pub candidate: MediaSide,
}

impl DiagnosticReport {
    pub fn from_validation(original: &Path, candidate: &Path, validation: &Validation) -> Self {
        let reason = match validation.verdict {
            Verdict::Failed { reason } => reason.message().to_string(),
            Verdict::Bigger { .. } => "output bigger than original".to_string(),
            Verdict::Accept => "accepted".to_string(),
        };
        Self {
            created_at_unix_ms: current_timestamp_ms(),
            verdict: validation.verdict,
            reason,
            original: MediaSide::new(original, validation.original_bytes, validation.original.as_ref()),
            candidate: MediaSide::new(candidate, validation.candidate_bytes, validation.candidate.as_ref()),
        }
    }
}

/// Writes `report` for the file `source_name` into `reports_dir`. Never
/// overwrites an earlier report.
pub fn write_report(reports_dir: &Path, source_name: &Path, report: &DiagnosticReport) -> io::Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)?;
    let stem = source_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let path = unique_path(reports_dir, &format!("{}_report.json", stem));
    let json = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{AudioStream, VideoStream};
    use crate::validate::FailureReason;
    use tempfile::TempDir;

    fn validation() -> Validation {
        Validation {
            verdict: Verdict::Failed { reason: FailureReason::DurationMismatch },
            original: Some(MediaInfo {
                duration_secs: Some(60.0),
                size_bytes: 1000,
                video: Some(VideoStream {
                    codec_name: "h264".into(),
                    width: 1920,
                    height: 1080,
                    fps: Some(30.0),
                    bitrate_kbps: Some(8000.0),
                }),
                audio: vec![AudioStream {
                    codec_name: "aac".into(),
                    channels: 2,
                    bitrate_kbps: Some(192.0),
                    sample_rate: Some(48_000),
                }],
                subtitle_count: 0,
            }),
            candidate: None,
            original_bytes: 1000,
            candidate_bytes: 10,
        }
    }

    #[test]
    fn test_report_sides() {
        let report = DiagnosticReport::from_validation(
            Path::new("/t/a.mkv"),
            Path::new("/t/compressed_a.mp4"),
            &validation(),
        );
        assert_eq!(report.reason, "duration mismatch");
        assert_eq!(report.original.pixels, Some(1920 * 1080));
        assert_eq!(report.original.audio_sample_rate, Some(48_000));
        assert_eq!(report.candidate.duration_secs, None);
        assert_eq!(report.candidate.size_bytes, 10);
    }

    #[test]
    fn test_write_report_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let report = DiagnosticReport::from_validation(Path::new("a.mkv"), Path::new("b.mp4"), &validation());

        let first = write_report(temp_dir.path(), Path::new("/media/show.mkv"), &report).unwrap();
        let second = write_report(temp_dir.path(), Path::new("/media/show.mkv"), &report).unwrap();

        assert_eq!(first, temp_dir.path().join("show_report.json"));
        assert_eq!(second, temp_dir.path().join("show_report (1).json"));
        let parsed: DiagnosticReport =
            serde_json::from_str(&std::fs::read_to_string(&first).unwrap()).unwrap();
        assert_eq!(parsed.verdict, report.verdict);
    }
}
