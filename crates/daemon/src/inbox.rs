//! Drop-folder jobs.
//!
//! Files dropped into `Input` are encoded when the catalog queue is empty.
//! Results land in `Output`; sources that did not make it go to `Failed`.

use crate::bus::{JobOutcome, Phase};
use crate::lifecycle::{move_unique, mp4_name, stage_into, unique_path, LifecycleError};
use crate::scheduler::{JobContext, JobError};
use crate::stability::wait_until_ready;
use crate::validate::Verdict;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Most recently modified regular file directly inside `input_dir`.
/// Hidden, empty and unopenable files are skipped so they cannot hold the
/// worker; they are reconsidered on every call.
pub fn next_inbox_file(input_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(input_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() || meta.len() == 0 {
                return None;
            }
            if let Err(e) = std::fs::File::open(entry.path()) {
                debug!(path = %entry.path().display(), error = %e, "Skipping unreadable dropped file");
                return None;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

async fn park_in_failed(ctx: &JobContext, path: &Path) {
    match stage_into(path, &ctx.layout.failed).await {
        Ok(parked) => info!(path = %parked.display(), "Moved source to Failed"),
        Err(e) => error!(path = %path.display(), error = %e, "Failed to move source to Failed"),
    }
}

/// Runs one drop-folder job for `path`.
pub async fn process_inbox_file(ctx: &JobContext, path: &Path, cancel: &CancellationToken) -> JobOutcome {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(path = %path.display(), "Picked up dropped file");
    ctx.bus.phase(&name, Phase::Claimed);

    if let Err(e) = wait_until_ready(path, ctx.settings.file_ready_backoff, cancel).await {
        return match e {
            LifecycleError::Cancelled => {
                park_in_failed(ctx, path).await;
                JobOutcome::Cancelled
            }
            other => {
                error!(path = %path.display(), error = %other, "Dropped file unreadable");
                JobOutcome::Failed
            }
        };
    }

    ctx.bus.phase(&name, Phase::Staging);
    let staged = match stage_into(path, &ctx.layout.processing).await {
        Ok(staged) => staged,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to stage dropped file");
            return JobOutcome::Failed;
        }
    };
    let candidate = unique_path(&ctx.layout.temp, &mp4_name(&staged, "", ""));

    let outcome = match run(ctx, &name, &staged, &candidate, cancel).await {
        Ok(outcome) => outcome,
        Err(JobError::Cancelled) => {
            info!(file = %name, "Dropped-file job cancelled");
            JobOutcome::Cancelled
        }
        Err(e) => {
            error!(file = %name, error = %e, "Dropped-file job failed");
            JobOutcome::Failed
        }
    };

    remove_quietly(&candidate).await;
    if !matches!(outcome, JobOutcome::Committed { .. })
        && tokio::fs::try_exists(&staged).await.unwrap_or(false)
    {
        park_in_failed(ctx, &staged).await;
    }
    outcome
}

async fn run(
    ctx: &JobContext,
    name: &str,
    staged: &Path,
    candidate: &Path,
    cancel: &CancellationToken,
) -> Result<JobOutcome, JobError> {
    let validation = ctx.encode_and_validate(name, staged, candidate, None, cancel).await?;

    match validation.verdict {
        Verdict::Accept => {
            ctx.bus.phase(name, Phase::Committing);
            let output = move_unique(candidate, &ctx.layout.output, &mp4_name(staged, "", "_recoded")).await?;
            let trashed = stage_into(staged, &ctx.layout.trash).await?;
            ctx.prune_trash();
            info!(
                output = %output.display(),
                trashed = %trashed.display(),
                "Dropped file re-encoded"
            );
            Ok(JobOutcome::Committed {
                bytes_saved: validation.original_bytes.saturating_sub(validation.candidate_bytes),
            })
        }
        Verdict::Bigger { original_bytes, candidate_bytes } => {
            info!(file = name, original_bytes, candidate_bytes, "Output not smaller");
            Ok(JobOutcome::Rejected)
        }
        Verdict::Failed { reason } => {
            warn!(file = name, reason = reason.message(), "Validation failed");
            ctx.report(staged, staged, candidate, &validation);
            Ok(JobOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::scheduler::tests::{add_video, fixture, Behavior};
    use crate::scheduler::Tick;
    use filetime::{set_file_mtime, FileTime};

    #[test]
    fn test_next_inbox_file_prefers_newest() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let old = temp_dir.path().join("old.mkv");
        let new = temp_dir.path().join("new.mkv");
        std::fs::write(&old, b"a").unwrap();
        std::fs::write(&new, b"b").unwrap();
        std::fs::write(temp_dir.path().join(".hidden.mkv"), b"c").unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&new, FileTime::from_unix_time(2_000, 0)).unwrap();

        assert_eq!(next_inbox_file(temp_dir.path()), Some(new));
        assert_eq!(next_inbox_file(&temp_dir.path().join("missing")), None);
    }

    #[test]
    fn test_next_inbox_file_skips_empty_files() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let real = temp_dir.path().join("real.mkv");
        let empty = temp_dir.path().join("empty.mkv");
        std::fs::write(&real, b"data").unwrap();
        std::fs::write(&empty, b"").unwrap();
        set_file_mtime(&real, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&empty, FileTime::from_unix_time(2_000, 0)).unwrap();

        assert_eq!(next_inbox_file(temp_dir.path()), Some(real.clone()));
        std::fs::remove_file(&real).unwrap();
        assert_eq!(next_inbox_file(temp_dir.path()), None);
    }

    #[tokio::test]
    async fn test_empty_drop_does_not_block_catalog_queue() {
        let f = fixture(Behavior::Write(10));
        std::fs::write(f.layout.input.join("empty.mkv"), b"").unwrap();

        let tick = tokio::time::timeout(std::time::Duration::from_secs(2), f.scheduler.tick())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick, Tick::Idle);

        let record = add_video(&f, "queued.mkv", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();
        let tick = tokio::time::timeout(std::time::Duration::from_secs(2), f.scheduler.tick())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick, Tick::Ran(JobOutcome::Committed { bytes_saved: 990 }));
        assert!(f.layout.input.join("empty.mkv").exists());
    }

    #[tokio::test]
    async fn test_accepted_drop_lands_in_output() {
        let f = fixture(Behavior::Write(10));
        std::fs::write(f.layout.input.join("movie.mkv"), vec![1u8; 1000]).unwrap();

        let tick = f.scheduler.tick().await.unwrap();
        assert_eq!(tick, Tick::Ran(JobOutcome::Committed { bytes_saved: 990 }));

        assert_eq!(std::fs::metadata(f.layout.output.join("movie_recoded.mp4")).unwrap().len(), 10);
        assert!(f.layout.trash.join("movie.mkv").exists());
        assert_eq!(std::fs::read_dir(&f.layout.input).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&f.layout.processing).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_drop_parks_source() {
        let f = fixture(Behavior::Fail);
        std::fs::write(f.layout.input.join("movie.mkv"), vec![1u8; 1000]).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Ran(JobOutcome::Failed));
        assert!(f.layout.failed.join("movie.mkv").exists());
        assert!(f.layout.reports_dir().join("movie_report.json").exists());
        assert_eq!(std::fs::read_dir(&f.layout.temp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_bigger_drop_parks_source_without_report() {
        let f = fixture(Behavior::Write(5000));
        std::fs::write(f.layout.input.join("movie.mkv"), vec![1u8; 1000]).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Ran(JobOutcome::Rejected));
        assert!(f.layout.failed.join("movie.mkv").exists());
        assert!(!f.layout.reports_dir().exists());
    }

    #[tokio::test]
    async fn test_catalog_queue_runs_before_inbox() {
        let f = fixture(Behavior::Write(10));
        std::fs::write(f.layout.input.join("dropped.mkv"), vec![1u8; 1000]).unwrap();
        let record = add_video(&f, "queued.mkv", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();

        f.scheduler.tick().await.unwrap();
        assert!(f.layout.input.join("dropped.mkv").exists());
        assert_eq!(
            f.catalog.get(&record.id).unwrap().unwrap().status,
            crate::catalog::Status::Compressed
        );
    }
}
