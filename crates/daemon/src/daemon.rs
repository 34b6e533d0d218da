//! Daemon startup and task wiring.
//!
//! Startup order: config, tool checks, work tree, catalog, crash recovery.
//! `run` then starts the sleep inhibitor follower, the control server, the
//! maintenance task and the indexer, waits out the startup delay and hands
//! the current task to the re-encode worker.

use crate::bus::{CancelHandle, StatusBus};
use crate::catalog::{Catalog, CatalogError, SqliteCatalog};
use crate::encode::ffmpeg::EncoderSettings;
use crate::encode::{FfmpegTranscoder, Transcoder};
use crate::hardware::{GpuVendor, HardwareProbe, SysfsGpuProbe};
use crate::indexer::{IndexRules, Indexer};
use crate::layout::WorkLayout;
use crate::lifecycle::prune_trash;
use crate::power::{follow_running, platform_inhibitor};
use crate::probe::{FfprobeProbe, MediaProbe};
use crate::scheduler::{JobContext, Scheduler, SchedulerSettings};
use crate::server::{run_server, AppState};
use crate::startup::{run_startup_checks, StartupError};
use crate::validate::{Tolerances, Validator};
use crate::watch::watch_tree;
use squeeze_config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Cannot prepare work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub layout: WorkLayout,
    pub catalog: Arc<dyn Catalog>,
    pub bus: StatusBus,
    pub scheduler: Arc<Scheduler>,
    probe: Arc<dyn MediaProbe>,
}

impl Daemon {
    /// Loads `config_path` and builds the daemon with the real tools.
    pub fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, skip_checks)
    }

    pub fn with_config(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        if skip_checks {
            warn!("Skipping startup checks");
        } else {
            run_startup_checks()?;
        }

        let hardware = Arc::new(SysfsGpuProbe::default());
        match hardware.detect() {
            GpuVendor::None => warn!("No supported GPU found, every encode will be rejected"),
            vendor => info!(?vendor, "Detected GPU"),
        }
        if config.encoder.force_cpu {
            warn!("CPU mode forced, every encode will be rejected");
        }

        let transcoder = Arc::new(FfmpegTranscoder::new(
            hardware,
            config.encoder.force_cpu,
            EncoderSettings {
                quality: config.encoder.quality_level,
                nvidia_preset: config.encoder.nvidia_preset.clone(),
            },
        ));
        Self::build(config, transcoder, Arc::new(FfprobeProbe::default()))
    }

    /// Assembles the daemon around the given encoder and prober.
    pub fn build(
        config: Config,
        transcoder: Arc<dyn Transcoder>,
        probe: Arc<dyn MediaProbe>,
    ) -> Result<Self, DaemonError> {
        let layout = WorkLayout::new(&config.paths.work_path);
        layout.ensure().map_err(|source| DaemonError::WorkDir {
            path: layout.root.clone(),
            source,
        })?;

        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open(&layout.catalog_path())?);
        let bus = StatusBus::new();

        let ctx = JobContext {
            catalog: Arc::clone(&catalog),
            transcoder,
            probe: Arc::clone(&probe),
            validator: Validator::new(
                Arc::clone(&probe),
                Tolerances {
                    duration_secs: config.encoder.duration_tolerance_secs,
                    fps: config.encoder.fps_tolerance,
                },
                config.encoder.fps_sample_windows,
            ),
            bus: bus.clone(),
            layout: layout.clone(),
            indexer_root: config.paths.indexer_path.clone(),
            settings: SchedulerSettings {
                poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
                file_ready_backoff: Duration::from_millis(config.scheduler.file_ready_backoff_ms),
                trash_keep: config.trash.keep_files,
            },
        };
        let scheduler = Arc::new(Scheduler::new(ctx, CancelHandle::new()));

        info!(work = %layout.root.display(), catalog = %layout.catalog_path().display(), "Daemon initialized");
        Ok(Self {
            config,
            layout,
            catalog,
            bus,
            scheduler,
            probe,
        })
    }

    fn indexer(&self) -> Option<Arc<Indexer>> {
        let root = &self.config.paths.indexer_path;
        if root.as_os_str().is_empty() {
            info!("No indexer path configured, indexer disabled");
            return None;
        }
        if !root.is_dir() {
            warn!(path = %root.display(), "Indexer path is not a directory, indexer disabled");
            return None;
        }
        let rules = IndexRules::from_config(&self.config.indexer, vec![self.layout.root.clone()]);
        Some(Arc::new(Indexer::new(
            root.clone(),
            rules,
            Arc::clone(&self.catalog),
            Arc::clone(&self.probe),
            Duration::from_millis(self.config.indexer.settle_delay_ms),
        )))
    }

    fn spawn_indexer(&self, shutdown: &CancellationToken) {
        let Some(indexer) = self.indexer() else {
            return;
        };
        // Watch before scanning so nothing created during the scan is missed.
        let (watcher, events) = match watch_tree(indexer.root()) {
            Ok(pair) => pair,
            Err(e) => {
                error!(path = %indexer.root().display(), error = %e, "Failed to watch content tree");
                return;
            }
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _watcher = watcher;
            match indexer.full_scan().await {
                Ok(stats) => info!(?stats, "Initial scan complete"),
                Err(e) => error!(error = %e, "Initial scan failed"),
            }
            indexer.run(events, shutdown).await;
        });
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        self.scheduler.recover()?;

        tokio::spawn(follow_running(self.bus.subscribe(), platform_inhibitor()));

        let server = {
            let state = AppState {
                scheduler: Arc::clone(&self.scheduler),
                selection: self.config.selection.clone(),
            };
            let bind = self.config.server.bind.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = run_server(state, &bind, shutdown).await {
                    error!(error = %e, "Control server stopped");
                }
            })
        };

        tokio::spawn(run_maintenance(
            Arc::clone(&self.catalog),
            self.layout.trash.clone(),
            self.config.trash.keep_files,
            Duration::from_secs(self.config.maintenance.interval_secs.max(1)),
            shutdown.clone(),
        ));

        self.spawn_indexer(&shutdown);

        let delay = Duration::from_millis(self.config.scheduler.startup_delay_ms);
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "Waiting before starting the worker");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Arc::clone(&self.scheduler).run(shutdown.clone()).await;

        shutdown.cancel();
        if let Err(e) = server.await {
            warn!(error = %e, "Control server task ended abnormally");
        }
        maintenance_pass(self.catalog.as_ref(), &self.layout.trash, self.config.trash.keep_files);
        info!("Daemon stopped");
        Ok(())
    }
}

/// One round of housekeeping: WAL checkpoint, then trash pruning.
pub fn maintenance_pass(catalog: &dyn Catalog, trash_root: &Path, keep: usize) {
    if let Err(e) = catalog.checkpoint() {
        warn!(error = %e, "Catalog checkpoint failed");
    }
    match prune_trash(trash_root, keep) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Pruned trash"),
        Err(e) => warn!(error = %e, "Trash pruning failed"),
    }
}

async fn run_maintenance(
    catalog: Arc<dyn Catalog>,
    trash_root: PathBuf,
    keep: usize,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => maintenance_pass(catalog.as_ref(), &trash_root, keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Status;
    use crate::scheduler::tests::{Behavior, FakeTranscoder, SameVideoProbe};
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn test_config(temp_dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.work_path = temp_dir.join("Data");
        config.paths.indexer_path = temp_dir.join("media");
        config.indexer.min_file_size_mb = 0;
        config.indexer.settle_delay_ms = 10;
        config.scheduler.startup_delay_ms = 0;
        config.scheduler.poll_interval_ms = 10;
        config.scheduler.file_ready_backoff_ms = 10;
        config.server.bind = "127.0.0.1:0".to_string();
        config
    }

    #[test]
    fn test_build_creates_work_tree() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = Daemon::build(
            test_config(temp_dir.path()),
            FakeTranscoder::new(Behavior::Write(10)),
            Arc::new(SameVideoProbe),
        )
        .unwrap();

        for dir in ["Input", "Processing", "Output", "Failed", "Temp", "Trash", "Log"] {
            assert!(temp_dir.path().join("Data").join(dir).is_dir(), "{dir} missing");
        }
        assert!(daemon.layout.catalog_path().exists());
    }

    #[test]
    fn test_maintenance_pass_prunes_trash() {
        let temp_dir = TempDir::new().unwrap();
        let trash = temp_dir.path().join("Trash");
        std::fs::create_dir_all(trash.join("show")).unwrap();
        for (i, name) in ["a.mkv", "b.mkv", "show/c.mkv"].iter().enumerate() {
            let path = trash.join(name);
            std::fs::write(&path, b"x").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(1_000 + i as i64, 0)).unwrap();
        }
        let catalog = SqliteCatalog::open(&temp_dir.path().join("catalog.db")).unwrap();

        maintenance_pass(&catalog, &trash, 1);

        assert!(!trash.join("a.mkv").exists());
        assert!(!trash.join("b.mkv").exists());
        assert!(trash.join("show/c.mkv").exists());
    }

    #[tokio::test]
    async fn test_indexes_and_reencodes_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let media = temp_dir.path().join("media");
        std::fs::create_dir_all(&media).unwrap();
        std::fs::write(media.join("clip.mkv"), vec![3u8; 4096]).unwrap();

        let daemon = Daemon::build(
            test_config(temp_dir.path()),
            FakeTranscoder::new(Behavior::Write(100)),
            Arc::new(SameVideoProbe),
        )
        .unwrap();
        let catalog = Arc::clone(&daemon.catalog);
        let scheduler = Arc::clone(&daemon.scheduler);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        let id = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(record) = catalog.find_by_location(&media, "clip.mkv").unwrap() {
                    return record.id;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(scheduler.enqueue(&[id]).unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = catalog.get(&id).unwrap().unwrap();
                if record.status == Status::Compressed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(media.join("clip.mp4").exists());
        assert!(!media.join("clip.mkv").exists());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
