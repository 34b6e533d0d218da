//! Catalog of tracked video files.
//!
//! One [`VideoRecord`] per file under the indexed tree. The [`Catalog`] trait is
//! the contract the indexer and the scheduler consume; [`SqliteCatalog`] is the
//! shipped implementation.

pub mod sqlite;

pub use sqlite::SqliteCatalog;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Framerate every quality ratio is normalized to.
pub const REFERENCE_FPS: f64 = 30.0;

/// Error type for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record {0} not found")]
    NotFound(Uuid),

    #[error("Transition to {0} is not allowed through this operation")]
    InvalidTransition(Status),

    #[error("Catalog connection lock poisoned")]
    Poisoned,
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Original,
    ToProcess,
    Processing,
    Compressed,
    Bigger,
    FailedToCompress,
    Removed,
    Kept,
}

/// Display attributes of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Presentation {
    pub label: &'static str,
    pub icon: &'static str,
    pub color: &'static str,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Original,
        Status::ToProcess,
        Status::Processing,
        Status::Compressed,
        Status::Bigger,
        Status::FailedToCompress,
        Status::Removed,
        Status::Kept,
    ];

    /// Storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Original => "original",
            Status::ToProcess => "to_process",
            Status::Processing => "processing",
            Status::Compressed => "compressed",
            Status::Bigger => "bigger",
            Status::FailedToCompress => "failed_to_compress",
            Status::Removed => "removed",
            Status::Kept => "kept",
        }
    }

    pub fn presentation(&self) -> Presentation {
        let (label, icon, color) = match self {
            Status::Original => ("Original", "backup", "#6c757d"),
            Status::ToProcess => ("To Process", "schedule", "#007bff"),
            Status::Processing => ("Processing", "hourglass_bottom", "#17a2b8"),
            Status::Compressed => ("Compressed", "compress", "#28a745"),
            Status::Bigger => ("Bigger", "trending_up", "#ffc107"),
            Status::FailedToCompress => ("Failed", "error", "#dc3545"),
            Status::Removed => ("Removed", "delete", "#6c757d"),
            Status::Kept => ("Kept", "check_circle", "#20c997"),
        };
        Presentation { label, icon, color }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown status tag: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// One tracked video file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: Uuid,
    pub directory: PathBuf,
    pub filename: String,
    pub size_original: u64,
    /// Set only once a re-encode has been committed.
    pub size_compressed: Option<u64>,
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    /// Unix milliseconds.
    pub indexed_at: i64,
    /// Filesystem modification time at last index, unix milliseconds.
    pub last_modified: i64,
    pub status: Status,
}

impl VideoRecord {
    /// New `Original` record with no media attributes.
    pub fn new(directory: PathBuf, filename: String, size_original: u64, last_modified: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            directory,
            filename,
            size_original,
            size_compressed: None,
            duration_seconds: None,
            width: None,
            height: None,
            fps: None,
            indexed_at: current_timestamp_ms(),
            last_modified,
            status: Status::Original,
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    pub fn total_pixels(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(w as u64 * h as u64),
            _ => None,
        }
    }

    /// Percentage saved relative to the compressed size.
    pub fn compression_factor(&self) -> Option<f64> {
        match self.size_compressed {
            Some(compressed) if compressed > 0 && self.size_original > 0 => {
                Some((self.size_original as f64 / compressed as f64 - 1.0) * 100.0)
            }
            _ => None,
        }
    }

    pub fn quality_ratio_original(&self) -> Option<f64> {
        self.quality_ratio_for(self.size_original)
    }

    pub fn quality_ratio_compressed(&self) -> Option<f64> {
        self.size_compressed.and_then(|size| self.quality_ratio_for(size))
    }

    /// Bytes per pixel per second, scaled by 1000 and normalized to
    /// [`REFERENCE_FPS`]. Uses the compressed size when there is one.
    pub fn quality_ratio(&self) -> Option<f64> {
        if self.size_compressed.is_some() {
            self.quality_ratio_compressed()
        } else {
            self.quality_ratio_original()
        }
    }

    fn quality_ratio_for(&self, size: u64) -> Option<f64> {
        let duration = self.duration_seconds.filter(|d| *d > 0.0)?;
        let pixels = self.total_pixels()?;
        let ratio = size as f64 / duration / pixels as f64 * 1000.0;
        match self.fps {
            Some(fps) if fps > 0.0 => Some(ratio * REFERENCE_FPS / fps),
            _ => Some(ratio),
        }
    }
}

/// Persistence contract.
///
/// Implementations must make every multi-row or read-modify-write operation
/// atomic with respect to other callers.
pub trait Catalog: Send + Sync {
    fn get(&self, id: &Uuid) -> Result<Option<VideoRecord>, CatalogError>;

    fn find_by_location(
        &self,
        directory: &Path,
        filename: &str,
    ) -> Result<Option<VideoRecord>, CatalogError>;

    fn list_by_status(&self, status: Status) -> Result<Vec<VideoRecord>, CatalogError>;

    fn list_all(&self) -> Result<Vec<VideoRecord>, CatalogError>;

    /// Returns `false` when an active record already holds the location.
    fn insert(&self, record: &VideoRecord) -> Result<bool, CatalogError>;

    /// Rewrites size, media attributes and timestamps of an existing record.
    fn update_media(&self, record: &VideoRecord) -> Result<(), CatalogError>;

    fn delete(&self, id: &Uuid) -> Result<bool, CatalogError>;

    /// Moves every listed record currently in one of `from` to `to`, in one
    /// transaction. Leaving `Compressed` clears the compressed size.
    fn transition(&self, ids: &[Uuid], from: &[Status], to: Status) -> Result<usize, CatalogError>;

    /// Moves every record in `from` to `to`.
    fn reset_status(&self, from: Status, to: Status) -> Result<usize, CatalogError>;

    /// Atomically takes the oldest `ToProcess` record and marks it `Processing`.
    fn claim_next(&self) -> Result<Option<VideoRecord>, CatalogError>;

    /// Records a committed re-encode. Any other active record at the
    /// committed location is dropped in the same transaction.
    fn mark_compressed(
        &self,
        id: &Uuid,
        filename: &str,
        size_compressed: u64,
    ) -> Result<(), CatalogError>;

    /// Folds the write-ahead log back into the main store.
    fn checkpoint(&self) -> Result<(), CatalogError>;
}

/// Ids of `Original` records worth re-encoding, ranked highest ratio first.
pub fn select_over_quality(
    catalog: &dyn Catalog,
    threshold: f64,
    min_size_bytes: u64,
    max_last_modified: i64,
) -> Result<Vec<Uuid>, CatalogError> {
    let mut ranked: Vec<(f64, Uuid)> = catalog
        .list_by_status(Status::Original)?
        .into_iter()
        .filter(|r| r.size_original > min_size_bytes && r.last_modified < max_last_modified)
        .filter_map(|r| {
            r.quality_ratio_original()
                .filter(|ratio| *ratio > threshold)
                .map(|ratio| (ratio, r.id))
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(ranked.into_iter().map(|(_, id)| id).collect())
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    system_time_ms(SystemTime::now())
}

pub fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Formats bytes to human-readable form (B, KB, MB, GB, TB).
pub fn format_bytes(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "-".to_string();
    };
    const SIZES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut len = bytes as f64;
    let mut order = 0;
    while len >= 1024.0 && order < SIZES.len() - 1 {
        order += 1;
        len /= 1024.0;
    }
    let rounded = format!("{:.3}", len);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SIZES[order])
}

pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "-".to_string();
    };
    let total = seconds.max(0.0) as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours >= 1 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

pub fn format_resolution(width: Option<u32>, height: Option<u32>) -> String {
    match (width, height) {
        (Some(w), Some(h)) => format!("{}×{}", w, h),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hd_record(size: u64, duration: f64, fps: Option<f64>) -> VideoRecord {
        let mut record = VideoRecord::new(PathBuf::from("/media"), "clip.mkv".into(), size, 0);
        record.duration_seconds = Some(duration);
        record.width = Some(1920);
        record.height = Some(1080);
        record.fps = fps;
        record
    }

    #[test]
    fn test_status_tags_round_trip() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("nope".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_presentation_table() {
        assert_eq!(Status::FailedToCompress.presentation().label, "Failed");
        assert_eq!(Status::ToProcess.presentation().icon, "schedule");
        assert_eq!(Status::Kept.presentation().color, "#20c997");
    }

    #[test]
    fn test_new_record_defaults() {
        let record = VideoRecord::new(PathBuf::from("/media/a"), "b.mp4".into(), 42, 7);
        assert_eq!(record.status, Status::Original);
        assert_eq!(record.full_path(), PathBuf::from("/media/a/b.mp4"));
        assert_eq!(record.size_compressed, None);
        assert_eq!(record.total_pixels(), None);
        assert_eq!(record.quality_ratio(), None);
    }

    #[test]
    fn test_compression_factor() {
        let mut record = hd_record(500, 60.0, None);
        assert_eq!(record.compression_factor(), None);
        record.size_compressed = Some(200);
        let factor = record.compression_factor().unwrap();
        assert!((factor - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_quality_ratio_normalizes_framerate() {
        let at_30 = hd_record(1_000_000_000, 100.0, Some(30.0));
        let at_60 = hd_record(1_000_000_000, 100.0, Some(60.0));
        let unknown = hd_record(1_000_000_000, 100.0, None);

        let r30 = at_30.quality_ratio().unwrap();
        let r60 = at_60.quality_ratio().unwrap();
        assert!((r30 - unknown.quality_ratio().unwrap()).abs() < 1e-9);
        assert!((r30 - 2.0 * r60).abs() < 1e-9);
    }

    #[test]
    fn test_quality_ratio_prefers_compressed_size() {
        let mut record = hd_record(1_000_000_000, 100.0, Some(30.0));
        let original = record.quality_ratio().unwrap();
        record.size_compressed = Some(250_000_000);
        let compressed = record.quality_ratio().unwrap();
        assert!((original - 4.0 * compressed).abs() < 1e-9);
    }

    #[test]
    fn test_quality_ratio_requires_positive_duration() {
        let record = hd_record(1_000, 0.0, Some(30.0));
        assert_eq!(record.quality_ratio(), None);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(None), "-");
        assert_eq!(format_bytes(Some(512)), "512 B");
        assert_eq!(format_bytes(Some(1536)), "1.5 KB");
        assert_eq!(format_bytes(Some(5 * 1024 * 1024 * 1024)), "5 GB");
        assert_eq!(format_duration(Some(59.0)), "0:59");
        assert_eq!(format_duration(Some(3723.0)), "1:02:03");
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_resolution(Some(1920), Some(1080)), "1920×1080");
        assert_eq!(format_resolution(Some(1920), None), "-");
    }

    proptest! {
        #[test]
        fn prop_bigger_files_rank_higher(size in 1u64..1_000_000_000, extra in 1u64..1_000_000_000) {
            let small = hd_record(size, 60.0, Some(25.0));
            let large = hd_record(size + extra, 60.0, Some(25.0));
            prop_assert!(large.quality_ratio().unwrap() > small.quality_ratio().unwrap());
        }
    }
}
