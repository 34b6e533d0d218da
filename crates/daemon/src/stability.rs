//! Readiness checks for files that may still be written to.
//!
//! A file is ready once it can be opened, is non-empty, and its size did
//! not change across one backoff interval. Anything else is treated as
//! transient and retried until ready or cancelled.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lifecycle::LifecycleError;

/// Result of comparing two observations of a file's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    Stable,
    Unstable {
        initial_size: u64,
        current_size: u64,
    },
}

/// Pure size comparison. Empty files are never stable.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size && current_size > 0 {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

async fn observe(path: &Path) -> Option<u64> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    Some(metadata.len())
}

/// Waits until `path` is ready for reading.
///
/// # Arguments
/// * `path` - File to watch
/// * `backoff` - Fixed delay between observations
/// * `cancel` - Aborts the wait
///
/// # Returns
/// * `Ok(size)` once two consecutive observations agree
/// * `Err(LifecycleError::Cancelled)` if cancelled first
pub async fn wait_until_ready(
    path: &Path,
    backoff: Duration,
    cancel: &CancellationToken,
) -> Result<u64, LifecycleError> {
    let mut previous = observe(path).await;
    loop {
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
        }

        let current = observe(path).await;
        match (previous, current) {
            (Some(before), Some(now)) if compare_sizes(before, now) == StabilityResult::Stable => {
                return Ok(now);
            }
            _ => {
                debug!(path = %path.display(), ?previous, ?current, "File not ready yet");
            }
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);
            if initial_size == current_size && current_size > 0 {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(result, StabilityResult::Unstable { initial_size, current_size });
            }
        }
    }

    #[test]
    fn test_empty_file_is_unstable() {
        assert_eq!(
            compare_sizes(0, 0),
            StabilityResult::Unstable { initial_size: 0, current_size: 0 }
        );
    }

    #[tokio::test]
    async fn test_ready_file_returns_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("done.mkv");
        std::fs::write(&path, b"complete").unwrap();

        let size = wait_until_ready(&path, Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(size, 8);
    }

    #[tokio::test]
    async fn test_missing_file_waits_until_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("never.mkv");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = wait_until_ready(&path, Duration::from_millis(10), &cancel).await;
        assert!(matches!(result, Err(LifecycleError::Cancelled)));
    }
}
