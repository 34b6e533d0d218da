//! File lifecycle: staging, commit and trash retention.
//!
//! A job never touches the original until commit. The original is copied
//! into an isolated working directory, the encoder writes next to that copy,
//! and only a validated candidate is moved over the original's location.

use filetime::FileTime;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Errors that can occur while moving files between managed locations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cancellation was observed before an irreversible step.
    #[error("Cancelled")]
    Cancelled,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LifecycleError + '_ {
    move |source| LifecycleError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// First free path for `file_name` inside `dir`.
///
/// An existing `name.ext` yields `name (1).ext`, then `name (2).ext` and so on.
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// `stem` plus `suffix`, always with an `.mp4` extension.
pub fn mp4_name(path: &Path, prefix: &str, suffix: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{}{}.mp4", prefix, stem, suffix)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Moves a file, creating the destination's parent.
///
/// Tries rename first and falls back to copy + remove across filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<(), LifecycleError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    if fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).await.map_err(io_err(dst))?;
    fs::remove_file(src).await.map_err(io_err(src))?;
    Ok(())
}

/// Moves `src` into `dir` under `file_name`, or a numbered variant if taken.
pub async fn move_unique(src: &Path, dir: &Path, file_name: &str) -> Result<PathBuf, LifecycleError> {
    fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    let dst = unique_path(dir, file_name);
    move_file(src, &dst).await?;
    Ok(dst)
}

/// Moves `src` into `dir`, keeping its name when free.
pub async fn stage_into(src: &Path, dir: &Path) -> Result<PathBuf, LifecycleError> {
    move_unique(src, dir, &file_name_of(src)).await
}

/// Copies `src` to `dst`, aborting when `cancel` fires. A partial `dst` is removed.
pub async fn copy_cancellable(
    src: &Path,
    dst: &Path,
    cancel: &CancellationToken,
) -> Result<u64, LifecycleError> {
    let mut reader = fs::File::open(src).await.map_err(io_err(src))?;
    let mut writer = fs::File::create(dst).await.map_err(io_err(dst))?;

    let copy = async {
        let copied = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_all().await?;
        Ok::<u64, io::Error>(copied)
    };
    let outcome = tokio::select! {
        result = copy => Some(result),
        _ = cancel.cancelled() => None,
    };
    drop(writer);

    match outcome {
        Some(result) => result.map_err(io_err(dst)),
        None => {
            let _ = fs::remove_file(dst).await;
            Err(LifecycleError::Cancelled)
        }
    }
}

/// Where a file from the indexed tree goes in the trash.
///
/// The original's directory relative to `indexer_root` is mirrored below
/// `trash_root`. Files outside the indexed tree land in the trash root.
pub fn trash_mirror_path(trash_root: &Path, indexer_root: &Path, original: &Path) -> PathBuf {
    let relative_dir = original
        .parent()
        .and_then(|parent| parent.strip_prefix(indexer_root).ok())
        .unwrap_or_else(|| Path::new(""));
    unique_path(&trash_root.join(relative_dir), &file_name_of(original))
}

/// Path the committed file will take.
///
/// An `.mp4` original is replaced in place; anything else becomes
/// `<stem>.mp4` next to it, numbered if that name is taken.
pub fn replacement_path(original: &Path) -> PathBuf {
    let is_mp4 = original
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false);
    if is_mp4 {
        return original.to_path_buf();
    }
    let dir = original.parent().unwrap_or_else(|| Path::new(""));
    unique_path(dir, &mp4_name(original, "", ""))
}

/// Copies access and modification times from `source` metadata onto `target`.
pub fn restore_times(source: &std::fs::Metadata, target: &Path) -> io::Result<()> {
    let atime = FileTime::from_last_access_time(source);
    let mtime = FileTime::from_last_modification_time(source);
    filetime::set_file_times(target, atime, mtime)
}

/// Isolated working directory of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub dir: PathBuf,
    /// Copy of the original the encoder reads.
    pub input: PathBuf,
    /// Candidate the encoder writes.
    pub output: PathBuf,
}

impl JobWorkspace {
    pub fn for_job(temp_root: &Path, id: &Uuid, original: &Path) -> Self {
        let dir = temp_root.join(id.to_string());
        Self {
            input: dir.join(file_name_of(original)),
            output: dir.join(mp4_name(original, "compressed_", "")),
            dir,
        }
    }

    /// Creates the directory and copies the original into it.
    pub async fn stage(&self, original: &Path, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;
        let bytes = copy_cancellable(original, &self.input, cancel).await?;
        debug!(path = %self.input.display(), bytes, "Staged working copy");
        Ok(())
    }

    /// Best-effort removal of the whole working directory.
    pub async fn discard(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %e, "Failed to remove working directory");
            }
        }
    }
}

/// Result of a committed replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub path: PathBuf,
    pub size: u64,
    pub trashed: PathBuf,
}

impl Committed {
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// Replaces `original` with the validated candidate of `workspace`.
///
/// Steps, in order:
/// 1. move the working copy of the original into the mirrored trash;
/// 2. copy the candidate to a hidden `.partial` file beside the original;
/// 3. give it the original's access/modification times;
/// 4. rename it into place, then remove the original if the name changed.
///
/// Cancellation is honoured up to the rename. Until then the original is
/// untouched.
pub async fn commit_replacement(
    original: &Path,
    workspace: &JobWorkspace,
    trash_root: &Path,
    indexer_root: &Path,
    cancel: &CancellationToken,
) -> Result<Committed, LifecycleError> {
    if cancel.is_cancelled() {
        return Err(LifecycleError::Cancelled);
    }

    let original_meta = fs::metadata(original).await.map_err(io_err(original))?;

    let trashed = trash_mirror_path(trash_root, indexer_root, original);
    move_file(&workspace.input, &trashed).await?;

    let final_path = replacement_path(original);
    let dir = final_path.parent().unwrap_or_else(|| Path::new(""));
    let partial = dir.join(format!(".{}.partial", file_name_of(&final_path)));

    let size = copy_cancellable(&workspace.output, &partial, cancel).await?;
    if let Err(e) = restore_times(&original_meta, &partial) {
        warn!(path = %partial.display(), error = %e, "Could not restore timestamps");
    }

    if cancel.is_cancelled() {
        let _ = fs::remove_file(&partial).await;
        return Err(LifecycleError::Cancelled);
    }

    fs::rename(&partial, &final_path)
        .await
        .map_err(io_err(&final_path))?;
    if final_path != original {
        fs::remove_file(original).await.map_err(io_err(original))?;
    }

    info!(
        original = %original.display(),
        replacement = %final_path.display(),
        size,
        "Committed re-encode"
    );

    Ok(Committed {
        path: final_path,
        size,
        trashed,
    })
}

/// Keeps the `keep` most recently modified files under `trash_root`.
///
/// Older files are deleted and directories emptied by the purge are removed.
/// Returns the number of files deleted.
pub fn prune_trash(trash_root: &Path, keep: usize) -> io::Result<usize> {
    if !trash_root.is_dir() {
        return Ok(0);
    }

    let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(trash_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.into_path())
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in files.into_iter().skip(keep) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune trash file"),
        }
    }

    // contents_first visits children before their parent.
    for entry in WalkDir::new(trash_root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
    {
        let _ = std::fs::remove_dir(entry.path());
    }

    if removed > 0 {
        info!(removed, keep, "Pruned trash");
    }
    Ok(removed)
}
