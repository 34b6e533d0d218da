//! Indexer: keeps the catalog in step with the content tree.
//!
//! A full scan runs at startup, followed by a reconciliation pass that drops
//! records whose files vanished while the daemon was down. Afterwards the
//! watcher feeds live events through [`Indexer::handle_event`].
//!
//! Records in `Processing` belong to the worker and are never touched here.

use crate::catalog::{system_time_ms, Catalog, CatalogError, Status, VideoRecord};
use crate::probe::{MediaInfo, MediaProbe};
use crate::watch::FsEvent;
use squeeze_config::IndexerConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Directory walk aborted: {0}")]
    Walk(String),
}

/// Eligibility rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRules {
    /// Lowercase, dot-prefixed.
    pub extensions: Vec<String>,
    pub min_size_bytes: u64,
    /// Folder names never descended into, compared case-insensitively.
    pub ignore_folders: Vec<String>,
    /// Subtrees never indexed, such as the daemon's own work directory.
    pub excluded: Vec<PathBuf>,
}

impl IndexRules {
    pub fn from_config(cfg: &IndexerConfig, excluded: Vec<PathBuf>) -> Self {
        let extensions = cfg
            .video_extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();
        Self {
            extensions,
            min_size_bytes: cfg.min_file_size_bytes(),
            ignore_folders: cfg.ignore_folders.clone(),
            excluded,
        }
    }

    pub fn has_video_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = format!(".{}", ext.to_lowercase());
                self.extensions.contains(&ext)
            })
            .unwrap_or(false)
    }

    pub fn is_denied_name(&self, name: &str) -> bool {
        self.ignore_folders
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(name))
    }

    /// True if `path` sits below a denied folder or an excluded subtree.
    pub fn is_denied(&self, root: &Path, path: &Path) -> bool {
        if self.excluded.iter().any(|ex| path.starts_with(ex)) {
            return true;
        }
        let Some(parent) = path.parent() else {
            return false;
        };
        let relative = parent.strip_prefix(root).unwrap_or(parent);
        relative
            .components()
            .any(|c| self.is_denied_name(&c.as_os_str().to_string_lossy()))
    }

    pub fn is_eligible(&self, root: &Path, path: &Path, size: u64) -> bool {
        self.has_video_extension(path) && size >= self.min_size_bytes && !self.is_denied(root, path)
    }
}

/// A file seen on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: i64,
}

impl Observed {
    fn from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        Self {
            path,
            size: metadata.len(),
            modified_ms: system_time_ms(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        }
    }
}

/// Every regular file below `start` outside denied folders.
///
/// Unreadable directories are logged and skipped.
pub fn walk_tree(start: &Path, rules: &IndexRules) -> Vec<Observed> {
    let walker = WalkDir::new(start).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !rules.is_denied_name(&name) && !rules.excluded.iter().any(|ex| entry.path().starts_with(ex))
    });

    let mut observed = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => observed.push(Observed::from_metadata(entry.into_path(), &metadata)),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to stat file"),
        }
    }
    observed
}

/// Counters of one full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_seen: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub removed: usize,
}

fn split_location(path: &Path) -> Option<(PathBuf, String)> {
    let directory = path.parent()?.to_path_buf();
    let filename = path.file_name()?.to_string_lossy().into_owned();
    Some((directory, filename))
}

fn apply_media(record: &mut VideoRecord, info: Option<&MediaInfo>) {
    record.duration_seconds = info.and_then(|i| i.duration_secs);
    record.width = info.and_then(MediaInfo::width);
    record.height = info.and_then(MediaInfo::height);
    record.fps = info.and_then(MediaInfo::fps);
}

pub struct Indexer {
    root: PathBuf,
    rules: IndexRules,
    catalog: Arc<dyn Catalog>,
    probe: Arc<dyn MediaProbe>,
    settle_delay: Duration,
    pending: Mutex<HashSet<PathBuf>>,
}

impl Indexer {
    pub fn new(
        root: PathBuf,
        rules: IndexRules,
        catalog: Arc<dyn Catalog>,
        probe: Arc<dyn MediaProbe>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            root,
            rules,
            catalog,
            probe,
            settle_delay,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn probe_quietly(&self, path: &Path) -> Option<MediaInfo> {
        match self.probe.probe(path).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Probe failed, indexing without media info");
                None
            }
        }
    }

    async fn walk(&self, start: &Path) -> Result<Vec<Observed>, IndexerError> {
        let start = start.to_path_buf();
        let rules = self.rules.clone();
        tokio::task::spawn_blocking(move || walk_tree(&start, &rules))
            .await
            .map_err(|e| IndexerError::Walk(e.to_string()))
    }

    /// Inserts or refreshes one observed file. Returns what changed.
    async fn apply_observed(&self, observed: &Observed) -> Result<Applied, CatalogError> {
        let Some((directory, filename)) = split_location(&observed.path) else {
            return Ok(Applied::Nothing);
        };

        match self.catalog.find_by_location(&directory, &filename)? {
            None => {
                if !self.rules.is_eligible(&self.root, &observed.path, observed.size) {
                    return Ok(Applied::Nothing);
                }
                let info = self.probe_quietly(&observed.path).await;
                let mut record =
                    VideoRecord::new(directory, filename, observed.size, observed.modified_ms);
                apply_media(&mut record, info.as_ref());
                if self.catalog.insert(&record)? {
                    info!(path = %observed.path.display(), id = %record.id, "Indexed");
                    Ok(Applied::Inserted)
                } else {
                    Ok(Applied::Nothing)
                }
            }
            Some(record) if record.status == Status::Processing => Ok(Applied::Nothing),
            Some(mut record) => {
                if observed.modified_ms <= record.last_modified {
                    return Ok(Applied::Nothing);
                }
                let info = self.probe_quietly(&observed.path).await;
                record.size_original = observed.size;
                record.last_modified = observed.modified_ms;
                apply_media(&mut record, info.as_ref());
                self.catalog.update_media(&record)?;
                debug!(path = %observed.path.display(), id = %record.id, "Refreshed");
                Ok(Applied::Refreshed)
            }
        }
    }

    /// Walks the whole tree, indexes what is new, then reconciles.
    pub async fn full_scan(&self) -> Result<ScanStats, IndexerError> {
        info!(root = %self.root.display(), "Scanning for existing video files");
        let observed = self.walk(&self.root).await?;

        let mut stats = ScanStats {
            files_seen: observed.len(),
            ..ScanStats::default()
        };
        for file in &observed {
            match self.apply_observed(file).await? {
                Applied::Inserted => stats.inserted += 1,
                Applied::Refreshed => stats.refreshed += 1,
                Applied::Nothing => {}
            }
        }

        let present: HashSet<PathBuf> = observed.into_iter().map(|o| o.path).collect();
        stats.removed = self.reconcile(&present)?;

        info!(
            seen = stats.files_seen,
            inserted = stats.inserted,
            refreshed = stats.refreshed,
            removed = stats.removed,
            "Initial indexing complete"
        );
        Ok(stats)
    }

    /// Deletes records under the root whose file was not seen, or that now
    /// sit below a denied folder.
    pub fn reconcile(&self, present: &HashSet<PathBuf>) -> Result<usize, CatalogError> {
        let mut removed = 0;
        for record in self.catalog.list_all()? {
            if record.status == Status::Processing || !record.directory.starts_with(&self.root) {
                continue;
            }
            let path = record.full_path();
            if self.rules.is_denied(&self.root, &path) || !present.contains(&path) {
                if self.catalog.delete(&record.id)? {
                    info!(path = %path.display(), id = %record.id, "Removed from index");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Brings the record for one file up to date, inserting it if eligible.
    pub async fn refresh_file(&self, path: &Path) -> Result<(), IndexerError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(()),
        };
        if metadata.is_dir() {
            for observed in self.walk(path).await? {
                self.apply_observed(&observed).await?;
            }
            return Ok(());
        }
        if !metadata.is_file() {
            return Ok(());
        }
        if self.rules.is_denied(&self.root, path) {
            return Ok(());
        }
        self.apply_observed(&Observed::from_metadata(path.to_path_buf(), &metadata))
            .await?;
        Ok(())
    }

    /// Drops the record at `path`, or every record below it for a directory.
    pub fn remove_path(&self, path: &Path) -> Result<usize, CatalogError> {
        let mut removed = 0;
        if let Some((directory, filename)) = split_location(path) {
            if let Some(record) = self.catalog.find_by_location(&directory, &filename)? {
                if record.status != Status::Processing && self.catalog.delete(&record.id)? {
                    info!(path = %path.display(), id = %record.id, "Removed from index");
                    removed += 1;
                }
            }
        }
        for record in self.catalog.list_all()? {
            if record.status != Status::Processing
                && record.directory.starts_with(path)
                && self.catalog.delete(&record.id)?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Refreshes `path` once the settle delay has passed. Bursts of events
    /// for the same path collapse into one refresh.
    fn schedule_refresh(self: &Arc<Self>, path: PathBuf) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(path.clone()) {
                return;
            }
        }
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(indexer.settle_delay).await;
            indexer
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);
            if let Err(e) = indexer.refresh_file(&path).await {
                error!(path = %path.display(), error = %e, "Failed to index file");
            }
        });
    }

    pub fn handle_event(self: &Arc<Self>, event: FsEvent) {
        let result = match event {
            FsEvent::Created(path) | FsEvent::Modified(path) => {
                self.schedule_refresh(path);
                Ok(())
            }
            FsEvent::Removed(path) => self.remove_path(&path).map(|_| ()),
            FsEvent::Renamed { from, to } => {
                let removed = self.remove_path(&from).map(|_| ());
                self.schedule_refresh(to);
                removed
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to apply filesystem event");
        }
    }

    /// Consumes watcher events until `shutdown` fires or the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<FsEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        debug!("Indexer event loop stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Nothing,
    Inserted,
    Refreshed,
}
