//! Post-encode validation.
//!
//! A candidate is only accepted when it is provably the same video: same
//! duration within tolerance, same pixel count, same framerate within
//! tolerance, and strictly smaller than the source.

use crate::probe::{Essentials, MediaInfo, MediaProbe};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Allowed deviations between source and candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub duration_secs: f64,
    pub fps: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            duration_secs: 0.5,
            fps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EncodeFailed,
    MediaInfoUnreadable,
    DurationMismatch,
    ResolutionChanged,
    FpsChanged,
}

impl FailureReason {
    pub fn message(&self) -> &'static str {
        match self {
            FailureReason::EncodeFailed => "failed to encode",
            FailureReason::MediaInfoUnreadable => "failed to read media info",
            FailureReason::DurationMismatch => "duration mismatch",
            FailureReason::ResolutionChanged => "resolution changed",
            FailureReason::FpsChanged => "fps changed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    /// Encode worked but saved nothing.
    Bigger {
        original_bytes: u64,
        candidate_bytes: u64,
    },
    Failed {
        reason: FailureReason,
    },
}

impl Verdict {
    fn failed(reason: FailureReason) -> Self {
        Verdict::Failed { reason }
    }
}

/// What the decision rule looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub original: Option<Essentials>,
    pub candidate: Option<Essentials>,
    pub original_bytes: u64,
    pub candidate_bytes: u64,
}

fn fps_differs(m: &Measurements, tolerances: &Tolerances) -> bool {
    match (m.original, m.candidate) {
        (Some(o), Some(c)) => (o.fps - c.fps).abs() > tolerances.fps,
        _ => false,
    }
}

/// Whether [`decide`] will need the source's sampled framerate range.
pub fn needs_fps_range(encode_ok: bool, m: &Measurements, tolerances: &Tolerances) -> bool {
    if !encode_ok {
        return false;
    }
    match (m.original, m.candidate) {
        (Some(o), Some(c)) => {
            (o.duration_secs - c.duration_secs).abs() <= tolerances.duration_secs
                && o.pixels() == c.pixels()
                && fps_differs(m, tolerances)
        }
        _ => false,
    }
}

/// The decision rule. Checks run in order and the first failure wins.
///
/// `fps_range` is the (min, max) framerate of the source over several
/// windows. A spread of at least the tolerance marks the source as
/// variable-framerate and excuses an fps mismatch.
pub fn decide(
    encode_ok: bool,
    m: &Measurements,
    tolerances: &Tolerances,
    fps_range: Option<(f64, f64)>,
) -> Verdict {
    if !encode_ok {
        return Verdict::failed(FailureReason::EncodeFailed);
    }

    let (Some(original), Some(candidate)) = (m.original, m.candidate) else {
        return Verdict::failed(FailureReason::MediaInfoUnreadable);
    };

    if (original.duration_secs - candidate.duration_secs).abs() > tolerances.duration_secs {
        return Verdict::failed(FailureReason::DurationMismatch);
    }

    if original.pixels() != candidate.pixels() {
        return Verdict::failed(FailureReason::ResolutionChanged);
    }

    if fps_differs(m, tolerances) {
        let variable = fps_range
            .map(|(lo, hi)| hi - lo >= tolerances.fps)
            .unwrap_or(false);
        if !variable {
            return Verdict::failed(FailureReason::FpsChanged);
        }
    }

    if m.candidate_bytes >= m.original_bytes {
        return Verdict::Bigger {
            original_bytes: m.original_bytes,
            candidate_bytes: m.candidate_bytes,
        };
    }

    Verdict::Accept
}

/// Outcome plus the probe results it was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub verdict: Verdict,
    pub original: Option<MediaInfo>,
    pub candidate: Option<MediaInfo>,
    pub original_bytes: u64,
    pub candidate_bytes: u64,
}

/// Probes both sides and applies [`decide`].
#[derive(Clone)]
pub struct Validator {
    probe: Arc<dyn MediaProbe>,
    tolerances: Tolerances,
    fps_windows: u32,
}

impl Validator {
    pub fn new(probe: Arc<dyn MediaProbe>, tolerances: Tolerances, fps_windows: u32) -> Self {
        Self {
            probe,
            tolerances,
            fps_windows,
        }
    }

    async fn probe_side(&self, path: &Path) -> (Option<MediaInfo>, u64) {
        let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        match self.probe.probe(path).await {
            Ok(info) => (Some(info), bytes),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Probe failed during validation");
                (None, bytes)
            }
        }
    }

    /// Validates `candidate` against `original`. `encode_ok` is false when
    /// the encoder itself reported failure; both sides are still probed so
    /// the report can compare them, but the verdict is fixed.
    pub async fn validate(&self, original: &Path, candidate: &Path, encode_ok: bool) -> Validation {
        let (original_info, original_bytes) = self.probe_side(original).await;
        let (candidate_info, candidate_bytes) = self.probe_side(candidate).await;

        let measurements = Measurements {
            original: original_info.as_ref().and_then(MediaInfo::essentials),
            candidate: candidate_info.as_ref().and_then(MediaInfo::essentials),
            original_bytes,
            candidate_bytes,
        };

        let fps_range = if needs_fps_range(encode_ok, &measurements, &self.tolerances) {
            match self.probe.fps_range(original, self.fps_windows).await {
                Ok(range) => {
                    debug!(path = %original.display(), ?range, "Sampled source framerate range");
                    Some(range)
                }
                Err(e) => {
                    warn!(path = %original.display(), error = %e, "Framerate sampling failed");
                    None
                }
            }
        } else {
            None
        };

        Validation {
            verdict: decide(encode_ok, &measurements, &self.tolerances, fps_range),
            original: original_info,
            candidate: candidate_info,
            original_bytes,
            candidate_bytes,
        }
    }
}
