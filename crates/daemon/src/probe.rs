//! Media probing through ffprobe.
//!
//! [`MediaProbe`] is what the indexer and the validator consume;
//! [`FfprobeProbe`] runs the external binary. Parsing is kept in pure
//! functions so it can be tested without ffprobe installed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Length of each window used when sampling a source's framerate.
pub const FPS_SAMPLE_SECS: f64 = 10.0;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second, from the average framerate when known.
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub channels: u32,
    pub bitrate_kbps: Option<f64>,
    pub sample_rate: Option<u32>,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    /// First video stream, the one that gets re-encoded.
    pub video: Option<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitle_count: usize,
}

/// The attributes both sides of a validation must have.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Essentials {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Essentials {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl MediaInfo {
    pub fn has_subtitles(&self) -> bool {
        self.subtitle_count > 0
    }

    /// Duration, dimensions and framerate, or `None` if any is missing.
    pub fn essentials(&self) -> Option<Essentials> {
        let video = self.video.as_ref()?;
        let duration_secs = self.duration_secs.filter(|d| *d > 0.0)?;
        let fps = video.fps.filter(|f| *f > 0.0)?;
        if video.width == 0 || video.height == 0 {
            return None;
        }
        Some(Essentials {
            duration_secs,
            width: video.width,
            height: video.height,
            fps,
        })
    }

    pub fn width(&self) -> Option<u32> {
        self.video.as_ref().map(|v| v.width).filter(|w| *w > 0)
    }

    pub fn height(&self) -> Option<u32> {
        self.video.as_ref().map(|v| v.height).filter(|h| *h > 0)
    }

    pub fn fps(&self) -> Option<f64> {
        self.video.as_ref().and_then(|v| v.fps)
    }
}

/// Probe contract.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;

    /// Minimum and maximum framerate measured over `windows` spread-out
    /// windows of the first video stream.
    async fn fps_range(&self, path: &Path, windows: u32) -> Result<(f64, f64), ProbeError>;
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
        pub sample_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parses an ffprobe `N/D` rational. `0/0` and garbage yield `None`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

fn kbps(bit_rate: Option<&String>) -> Option<f64> {
    bit_rate
        .and_then(|br| br.parse::<f64>().ok())
        .map(|bps| bps / 1000.0)
}

/// Parses `ffprobe -print_format json -show_streams -show_format` output.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut info = MediaInfo {
        size_bytes: format
            .size
            .as_ref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0),
        duration_secs: format.duration.as_ref().and_then(|d| d.parse::<f64>().ok()),
        ..MediaInfo::default()
    };
    let mut video_duration = None;

    for stream in ffprobe.streams.unwrap_or_default() {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" if info.video.is_none() => {
                let fps = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));
                video_duration = stream.duration.as_ref().and_then(|d| d.parse::<f64>().ok());
                info.video = Some(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    fps,
                    bitrate_kbps: kbps(stream.bit_rate.as_ref()),
                });
            }
            "audio" => info.audio.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
                bitrate_kbps: kbps(stream.bit_rate.as_ref()),
                sample_rate: stream.sample_rate.as_ref().and_then(|s| s.parse().ok()),
            }),
            "subtitle" => info.subtitle_count += 1,
            _ => {}
        }
    }

    if info.duration_secs.is_none() {
        info.duration_secs = video_duration;
    }
    Ok(info)
}

/// Start offsets of `windows` sampling windows spread across `duration`.
pub fn window_starts(duration: f64, windows: u32) -> Vec<f64> {
    let windows = windows.max(1);
    let usable = (duration - FPS_SAMPLE_SECS).max(0.0);
    if windows == 1 {
        return vec![usable / 2.0];
    }
    (0..windows)
        .map(|i| usable * i as f64 / (windows - 1) as f64)
        .collect()
}

/// Framerate implied by a list of packet timestamps, one per line.
pub fn fps_from_timestamps(output: &str) -> Option<f64> {
    let mut stamps: Vec<f64> = output
        .lines()
        .filter_map(|line| line.trim().trim_end_matches(',').parse::<f64>().ok())
        .collect();
    if stamps.len() < 2 {
        return None;
    }
    stamps.sort_by(|a, b| a.total_cmp(b));
    let span = stamps[stamps.len() - 1] - stamps[0];
    if span <= 0.0 {
        return None;
    }
    Some((stamps.len() - 1) as f64 / span)
}

/// Probe backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: String,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self {
            binary: "ffprobe".to_string(),
        }
    }
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str], path: &Path) -> Result<String, ProbeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let stdout = self
            .run(
                &["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"],
                path,
            )
            .await?;
        parse_ffprobe_output(&stdout)
    }

    async fn fps_range(&self, path: &Path, windows: u32) -> Result<(f64, f64), ProbeError> {
        let duration = self
            .probe(path)
            .await?
            .duration_secs
            .ok_or_else(|| ProbeError::ParseError("unknown duration".to_string()))?;

        let mut range: Option<(f64, f64)> = None;
        for start in window_starts(duration, windows) {
            let interval = format!("{:.3}%+{}", start, FPS_SAMPLE_SECS);
            let stdout = self
                .run(
                    &[
                        "-v", "error",
                        "-select_streams", "v:0",
                        "-read_intervals", &interval,
                        "-show_entries", "packet=pts_time",
                        "-of", "csv=p=0",
                    ],
                    path,
                )
                .await?;
            if let Some(fps) = fps_from_timestamps(&stdout) {
                debug!(path = %path.display(), start, fps, "Sampled framerate");
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(fps), hi.max(fps)),
                    None => (fps, fps),
                });
            }
        }

        range.ok_or_else(|| ProbeError::ParseError("no framerate samples".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "avg_frame_rate": "30000/1001", "r_frame_rate": "30000/1001", "bit_rate": "8000000"},
            {"codec_type": "audio", "codec_name": "aac", "channels": 2,
             "sample_rate": "48000", "bit_rate": "192000"},
            {"codec_type": "subtitle", "codec_name": "subrip"},
            {"codec_type": "subtitle", "codec_name": "ass"}
        ],
        "format": {"duration": "60.000000", "size": "524288000"}
    }"#;

    #[test]
    fn test_parse_full_output() {
        let info = parse_ffprobe_output(SAMPLE).unwrap();
        assert_eq!(info.size_bytes, 524_288_000);
        assert_eq!(info.duration_secs, Some(60.0));
        assert_eq!(info.subtitle_count, 2);
        assert!(info.has_subtitles());

        let video = info.video.as_ref().unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert!((video.fps.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(video.bitrate_kbps, Some(8000.0));

        assert_eq!(info.audio[0].sample_rate, Some(48_000));
        assert_eq!(info.audio[0].bitrate_kbps, Some(192.0));

        let essentials = info.essentials().unwrap();
        assert_eq!(essentials.pixels(), 1920 * 1080);
    }

    #[test]
    fn test_falls_back_to_stream_duration_and_r_frame_rate() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "hevc", "width": 640, "height": 360,
                         "avg_frame_rate": "0/0", "r_frame_rate": "25/1", "duration": "12.5"}],
            "format": {}
        }"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.duration_secs, Some(12.5));
        assert_eq!(info.fps(), Some(25.0));
    }

    #[test]
    fn test_missing_video_has_no_essentials() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "flac"}],
                      "format": {"duration": "3.0"}}"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert!(info.essentials().is_none());
        assert_eq!(info.width(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_ffprobe_output("not json"), Err(ProbeError::ParseError(_))));
        assert!(matches!(parse_ffprobe_output(r#"{"streams": []}"#), Err(ProbeError::ParseError(_))));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_fps_from_timestamps() {
        let csv = "0.000000\n0.040000\n0.080000\n0.120000\n0.160000\n";
        assert!((fps_from_timestamps(csv).unwrap() - 25.0).abs() < 1e-6);
        assert_eq!(fps_from_timestamps("1.0\n"), None);
        assert_eq!(fps_from_timestamps(""), None);
    }

    #[test]
    fn test_window_starts() {
        assert_eq!(window_starts(110.0, 3), vec![0.0, 50.0, 100.0]);
        assert_eq!(window_starts(5.0, 3), vec![0.0, 0.0, 0.0]);
        assert_eq!(window_starts(30.0, 1), vec![10.0]);
    }

    proptest! {
        #[test]
        fn prop_windows_stay_inside_duration(duration in 0.0f64..100_000.0, windows in 0u32..10) {
            let starts = window_starts(duration, windows);
            prop_assert_eq!(starts.len(), windows.max(1) as usize);
            for start in starts {
                prop_assert!(start >= 0.0);
                prop_assert!(start <= duration.max(0.0));
            }
        }
    }
}
