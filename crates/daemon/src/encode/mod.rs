//! Encoder adapter.
//!
//! Strategy selection is GPU-only: with no supported GPU, or with CPU mode
//! forced, the adapter refuses instead of falling back to a software encoder.

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegTranscoder};

use crate::bus::Progress;
use crate::hardware::GpuVendor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for encoding operations.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("No GPU found: no eligible encoder")]
    NoEligibleEncoder,

    #[error("Please provide an mp4 file: {0}")]
    UnsupportedContainer(PathBuf),

    /// The encoder rejected the hardware path.
    #[error("GPU encoder failure: {0}")]
    GpuCapability(String),

    #[error("Encoder failed with exit code {code:?}: {tail}")]
    Failed { code: Option<i32>, tail: String },

    #[error("Encode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn is_gpu_capability(&self) -> bool {
        matches!(self, EncodeError::GpuCapability(_) | EncodeError::NoEligibleEncoder)
    }
}

/// Hardware encoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuStrategy {
    Nvenc,
    Amf,
}

/// Picks the encoder for the detected vendor.
pub fn select_strategy(vendor: GpuVendor, force_cpu: bool) -> Result<GpuStrategy, EncodeError> {
    match (vendor, force_cpu) {
        (_, true) | (GpuVendor::None, _) => Err(EncodeError::NoEligibleEncoder),
        (GpuVendor::Nvidia, false) => Ok(GpuStrategy::Nvenc),
        (GpuVendor::Amd, false) => Ok(GpuStrategy::Amf),
    }
}

/// One encode request.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub input: PathBuf,
    /// Must end in `.mp4`.
    pub output: PathBuf,
    /// Source duration, used to turn elapsed time into a percentage.
    pub duration_secs: Option<f64>,
    pub has_subtitles: bool,
}

impl EncodeJob {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            duration_secs: None,
            has_subtitles: false,
        }
    }
}

pub(crate) fn ensure_mp4(path: &Path) -> Result<(), EncodeError> {
    let is_mp4 = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false);
    if is_mp4 {
        Ok(())
    } else {
        Err(EncodeError::UnsupportedContainer(path.to_path_buf()))
    }
}

/// Progress callback handed to a transcoder.
pub type ProgressFn<'a> = &'a (dyn Fn(Progress) + Send + Sync);

/// Encoder contract.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encodes `job.input` into `job.output`. Must stop the external process
    /// promptly once `cancel` fires and return [`EncodeError::Cancelled`].
    async fn encode(
        &self,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_only_policy() {
        assert_eq!(select_strategy(GpuVendor::Nvidia, false).unwrap(), GpuStrategy::Nvenc);
        assert_eq!(select_strategy(GpuVendor::Amd, false).unwrap(), GpuStrategy::Amf);
        assert!(matches!(
            select_strategy(GpuVendor::None, false),
            Err(EncodeError::NoEligibleEncoder)
        ));
        assert!(matches!(
            select_strategy(GpuVendor::Nvidia, true),
            Err(EncodeError::NoEligibleEncoder)
        ));
    }

    #[test]
    fn test_ensure_mp4() {
        assert!(ensure_mp4(Path::new("/t/out.mp4")).is_ok());
        assert!(ensure_mp4(Path::new("/t/out.MP4")).is_ok());
        let err = ensure_mp4(Path::new("/t/out.mkv")).unwrap_err();
        assert!(err.to_string().contains("Please provide an mp4 file"));
    }

    #[test]
    fn test_gpu_capability_class() {
        assert!(EncodeError::GpuCapability("x".into()).is_gpu_capability());
        assert!(EncodeError::NoEligibleEncoder.is_gpu_capability());
        assert!(!EncodeError::Cancelled.is_gpu_capability());
    }
}
