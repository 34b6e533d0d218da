//! Re-encode worker.
//!
//! One serialized loop claims `ToProcess` records (falling back to files in
//! the drop folder) and drives each through
//! `Claimed → Staging → Encoding → Validating → Committing`.
//! Every per-job error ends as a catalog status plus a log line; nothing
//! escapes the loop.

use crate::bus::{CancelHandle, JobOutcome, Phase, Progress, StatusBus};
use crate::catalog::{
    current_timestamp_ms, select_over_quality, Catalog, CatalogError, Status, VideoRecord,
};
use crate::encode::{EncodeError, EncodeJob, Transcoder};
use crate::inbox;
use crate::layout::WorkLayout;
use crate::lifecycle::{commit_replacement, prune_trash, JobWorkspace, LifecycleError};
use crate::probe::MediaProbe;
use crate::report::{write_report, DiagnosticReport};
use crate::stability::wait_until_ready;
use crate::validate::{Validation, Validator, Verdict};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Error type for a single job. Resolved inside the worker, never returned
/// from [`Scheduler::run`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("File error: {0}")]
    Lifecycle(LifecycleError),

    #[error("Encode error: {0}")]
    Encode(EncodeError),

    #[error("Source file missing: {0}")]
    Missing(PathBuf),

    #[error("Source file is empty: {0}")]
    Empty(PathBuf),

    #[error("Job cancelled")]
    Cancelled,
}

impl From<LifecycleError> for JobError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Cancelled => JobError::Cancelled,
            other => JobError::Lifecycle(other),
        }
    }
}

impl From<EncodeError> for JobError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Cancelled => JobError::Cancelled,
            other => JobError::Encode(other),
        }
    }
}

/// Errors from operator actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Record {0} not found")]
    NotFound(Uuid),

    #[error("Record {0} is being processed")]
    Busy(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub file_ready_backoff: Duration,
    pub trash_keep: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            file_ready_backoff: Duration::from_millis(5000),
            trash_keep: 2,
        }
    }
}

/// Everything a job needs, shared by catalog and drop-folder jobs.
pub struct JobContext {
    pub catalog: Arc<dyn Catalog>,
    pub transcoder: Arc<dyn Transcoder>,
    pub probe: Arc<dyn MediaProbe>,
    pub validator: Validator,
    pub bus: StatusBus,
    pub layout: WorkLayout,
    pub indexer_root: PathBuf,
    pub settings: SchedulerSettings,
}

impl JobContext {
    /// Probes `input` for duration and subtitles, then encodes it.
    pub(crate) async fn encode(
        &self,
        input: &Path,
        output: &Path,
        known_duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        let info = self.probe.probe(input).await.ok();
        let job = EncodeJob {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            duration_secs: info.as_ref().and_then(|i| i.duration_secs).or(known_duration),
            has_subtitles: info.as_ref().map(|i| i.has_subtitles()).unwrap_or(false),
        };
        let bus = self.bus.clone();
        let on_progress = move |progress: Progress| bus.progress(progress);
        self.transcoder.encode(&job, &on_progress, cancel).await
    }

    /// Encodes `source` into `candidate` and judges the result.
    pub(crate) async fn encode_and_validate(
        &self,
        file: &str,
        source: &Path,
        candidate: &Path,
        known_duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<Validation, JobError> {
        self.bus.phase(file, Phase::Encoding);
        let encode_ok = match self.encode(source, candidate, known_duration, cancel).await {
            Ok(()) => true,
            Err(EncodeError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) if e.is_gpu_capability() => {
                warn!(file, error = %e, "GPU encoder unavailable");
                false
            }
            Err(e) => {
                warn!(file, error = %e, "Encode failed");
                false
            }
        };
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        self.bus.phase(file, Phase::Validating);
        Ok(self.validator.validate(source, candidate, encode_ok).await)
    }

    pub(crate) fn report(&self, source_name: &Path, source: &Path, candidate: &Path, validation: &Validation) {
        let report = DiagnosticReport::from_validation(source, candidate, validation);
        match write_report(&self.layout.reports_dir(), source_name, &report) {
            Ok(path) => info!(report = %path.display(), reason = %report.reason, "Wrote diagnostic report"),
            Err(e) => warn!(error = %e, "Failed to write diagnostic report"),
        }
    }

    pub(crate) fn prune_trash(&self) {
        if let Err(e) = prune_trash(&self.layout.trash, self.settings.trash_keep) {
            warn!(error = %e, "Trash pruning failed");
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Ran(JobOutcome),
    /// A pending cancellation dropped this many queued records.
    Aborted(usize),
}

pub struct Scheduler {
    ctx: JobContext,
    cancel: Arc<CancelHandle>,
}

impl Scheduler {
    pub fn new(ctx: JobContext, cancel: Arc<CancelHandle>) -> Self {
        Self { ctx, cancel }
    }

    pub fn bus(&self) -> &StatusBus {
        &self.ctx.bus
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.ctx.catalog
    }

    /// Demotes records left `Processing` by an unclean shutdown.
    pub fn recover(&self) -> Result<usize, CatalogError> {
        let recovered = self.ctx.catalog.reset_status(Status::Processing, Status::ToProcess)?;
        if recovered > 0 {
            warn!(recovered, "Re-queued records interrupted by shutdown");
        }
        Ok(recovered)
    }

    /// Flips `Original` records to `ToProcess` in one transaction.
    pub fn enqueue(&self, ids: &[Uuid]) -> Result<usize, CatalogError> {
        let queued = self
            .ctx
            .catalog
            .transition(ids, &[Status::Original], Status::ToProcess)?;
        info!(requested = ids.len(), queued, "Enqueued records");
        Ok(queued)
    }

    /// Enqueues every `Original` record over `threshold` that is larger than
    /// `min_size_bytes` and untouched for `min_age`.
    pub fn enqueue_over_threshold(
        &self,
        threshold: f64,
        min_size_bytes: u64,
        min_age: Duration,
    ) -> Result<usize, CatalogError> {
        let min_age_ms = i64::try_from(min_age.as_millis()).unwrap_or(i64::MAX);
        let max_last_modified = current_timestamp_ms().saturating_sub(min_age_ms);
        let ids = select_over_quality(self.ctx.catalog.as_ref(), threshold, min_size_bytes, max_last_modified)?;
        self.enqueue(&ids)
    }

    fn operator_transition(&self, id: &Uuid, to: Status) -> Result<VideoRecord, ActionError> {
        let record = self.ctx.catalog.get(id)?.ok_or(ActionError::NotFound(*id))?;
        let from: Vec<Status> = Status::ALL
            .into_iter()
            .filter(|s| *s != Status::Processing)
            .collect();
        if self.ctx.catalog.transition(&[*id], &from, to)? == 0 {
            return Err(ActionError::Busy(*id));
        }
        info!(id = %id, from = %record.status, to = %to, "Operator status change");
        self.ctx.catalog.get(id)?.ok_or(ActionError::NotFound(*id))
    }

    pub fn keep(&self, id: &Uuid) -> Result<VideoRecord, ActionError> {
        self.operator_transition(id, Status::Kept)
    }

    pub fn reset(&self, id: &Uuid) -> Result<VideoRecord, ActionError> {
        self.operator_transition(id, Status::Original)
    }

    pub fn request_cancel(&self) {
        info!("Cancellation requested");
        self.cancel.request_cancel();
    }

    /// Returns queued records to `Original`, plus `in_flight` if given.
    fn abort_batch(&self, in_flight: Option<Uuid>) -> usize {
        let mut reverted = 0;
        if let Some(id) = in_flight {
            match self.ctx.catalog.transition(&[id], &[Status::Processing], Status::Original) {
                Ok(n) => reverted += n,
                Err(e) => error!(id = %id, error = %e, "Failed to revert cancelled record"),
            }
        }
        match self.ctx.catalog.reset_status(Status::ToProcess, Status::Original) {
            Ok(n) => reverted += n,
            Err(e) => error!(error = %e, "Failed to revert queued records"),
        }
        info!(reverted, "Batch cancelled");
        reverted
    }

    fn settle(&self, id: &Uuid, to: Status) -> Result<(), CatalogError> {
        self.ctx.catalog.transition(&[*id], &[Status::Processing], to)?;
        Ok(())
    }

    async fn process_record(
        &self,
        record: &VideoRecord,
        workspace: &JobWorkspace,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let ctx = &self.ctx;
        let original = record.full_path();
        let name = record.filename.as_str();

        match tokio::fs::metadata(&original).await {
            Ok(meta) if meta.len() == 0 => return Err(JobError::Empty(original)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(JobError::Missing(original)),
            // Anything else is transient and left to the readiness wait.
            Err(_) => {}
        }

        ctx.bus.phase(name, Phase::Staging);
        wait_until_ready(&original, ctx.settings.file_ready_backoff, cancel).await?;
        workspace.stage(&original, cancel).await?;

        let validation = ctx
            .encode_and_validate(name, &workspace.input, &workspace.output, record.duration_seconds, cancel)
            .await?;

        match validation.verdict {
            Verdict::Accept => {
                ctx.bus.phase(name, Phase::Committing);
                let committed =
                    commit_replacement(&original, workspace, &ctx.layout.trash, &ctx.indexer_root, cancel)
                        .await?;
                ctx.catalog.mark_compressed(&record.id, &committed.file_name(), committed.size)?;
                ctx.prune_trash();
                Ok(JobOutcome::Committed {
                    bytes_saved: validation.original_bytes.saturating_sub(committed.size),
                })
            }
            Verdict::Bigger { original_bytes, candidate_bytes } => {
                info!(id = %record.id, original_bytes, candidate_bytes, "Output not smaller, keeping original");
                ctx.report(&original, &workspace.input, &workspace.output, &validation);
                self.settle(&record.id, Status::Bigger)?;
                Ok(JobOutcome::Rejected)
            }
            Verdict::Failed { reason } => {
                warn!(id = %record.id, reason = reason.message(), "Validation failed");
                ctx.report(&original, &workspace.input, &workspace.output, &validation);
                self.settle(&record.id, Status::FailedToCompress)?;
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn run_job(&self, record: VideoRecord, cancel: &CancellationToken) -> JobOutcome {
        info!(id = %record.id, path = %record.full_path().display(), "Claimed record");
        self.ctx.bus.phase(&record.filename, Phase::Claimed);

        let workspace = JobWorkspace::for_job(&self.ctx.layout.temp, &record.id, &record.full_path());
        let result = self.process_record(&record, &workspace, cancel).await;
        workspace.discard().await;

        match result {
            Ok(outcome) => outcome,
            Err(JobError::Cancelled) => {
                info!(id = %record.id, "Job cancelled");
                self.abort_batch(Some(record.id));
                JobOutcome::Cancelled
            }
            Err(e) => {
                error!(id = %record.id, error = %e, "Job failed");
                if let Err(e) = self.settle(&record.id, Status::FailedToCompress) {
                    error!(id = %record.id, error = %e, "Failed to record job failure");
                }
                JobOutcome::Failed
            }
        }
    }

    /// One iteration of the worker loop.
    pub async fn tick(&self) -> Result<Tick, CatalogError> {
        let cancel = self.cancel.current();
        if cancel.is_cancelled() {
            let reverted = self.abort_batch(None);
            self.cancel.renew();
            return Ok(Tick::Aborted(reverted));
        }

        let outcome = if let Some(record) = self.ctx.catalog.claim_next()? {
            self.run_job(record, &cancel).await
        } else if let Some(path) = inbox::next_inbox_file(&self.ctx.layout.input) {
            let outcome = inbox::process_inbox_file(&self.ctx, &path, &cancel).await;
            if outcome == JobOutcome::Cancelled {
                self.abort_batch(None);
            }
            outcome
        } else {
            return Ok(Tick::Idle);
        };

        if outcome == JobOutcome::Cancelled {
            self.cancel.renew();
        }
        self.ctx.bus.finish(outcome);
        Ok(Tick::Ran(outcome))
    }

    /// Worker loop. Returns once `shutdown` fires; an in-flight job is
    /// abandoned and picked up again by the next startup's recovery.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Re-encode worker started");
        loop {
            let scheduler = Arc::clone(&self);
            let mut handle = tokio::spawn(async move { scheduler.tick().await });

            let tick = tokio::select! {
                _ = shutdown.cancelled() => {
                    handle.abort();
                    break;
                }
                joined = &mut handle => joined,
            };

            let idle = match tick {
                Ok(Ok(Tick::Idle)) => true,
                Ok(Ok(_)) => false,
                Ok(Err(e)) => {
                    error!(error = %e, "Catalog error in worker loop");
                    true
                }
                Err(e) => {
                    error!(error = %e, "Worker iteration panicked");
                    self.fail_orphans();
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.ctx.settings.poll_interval) => {}
                }
            }
        }
        info!("Re-encode worker stopped");
    }

    /// After a panic the single worker owns every `Processing` record.
    fn fail_orphans(&self) {
        match self.ctx.catalog.reset_status(Status::Processing, Status::FailedToCompress) {
            Ok(n) if n > 0 => warn!(records = n, "Marked records of a crashed job as failed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to mark crashed job records"),
        }
        self.ctx.bus.finish(JobOutcome::Failed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::encode::ProgressFn;
    use crate::probe::{MediaInfo, ProbeError, VideoStream};
    use crate::validate::Tolerances;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    pub(crate) enum Behavior {
        Write(usize),
        Fail,
        WaitForCancel,
    }

    pub(crate) struct FakeTranscoder {
        pub behavior: Behavior,
        pub started: Notify,
        pub calls: AtomicUsize,
    }

    impl FakeTranscoder {
        pub fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self { behavior, started: Notify::new(), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn encode(
            &self,
            job: &EncodeJob,
            on_progress: ProgressFn<'_>,
            cancel: &CancellationToken,
        ) -> Result<(), EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            on_progress(Progress::Percent(50.0));
            match self.behavior {
                Behavior::Write(bytes) => {
                    std::fs::write(&job.output, vec![0u8; bytes])?;
                    Ok(())
                }
                Behavior::Fail => Err(EncodeError::Failed { code: Some(1), tail: "boom".into() }),
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(EncodeError::Cancelled)
                }
            }
        }
    }

    /// Every file looks like the same 1280x720 30fps 60s video.
    pub(crate) struct SameVideoProbe;

    #[async_trait]
    impl MediaProbe for SameVideoProbe {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
            if !path.exists() {
                return Err(ProbeError::FfprobeFailed("missing".into()));
            }
            Ok(MediaInfo {
                duration_secs: Some(60.0),
                video: Some(VideoStream {
                    codec_name: "h264".into(),
                    width: 1280,
                    height: 720,
                    fps: Some(30.0),
                    bitrate_kbps: None,
                }),
                ..MediaInfo::default()
            })
        }

        async fn fps_range(&self, _path: &Path, _windows: u32) -> Result<(f64, f64), ProbeError> {
            Ok((30.0, 30.0))
        }
    }

    pub(crate) struct Fixture {
        pub _temp_dir: TempDir,
        pub media: PathBuf,
        pub layout: WorkLayout,
        pub catalog: Arc<SqliteCatalog>,
        pub transcoder: Arc<FakeTranscoder>,
        pub scheduler: Arc<Scheduler>,
    }

    pub(crate) fn fixture(behavior: Behavior) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let media = temp_dir.path().join("media");
        std::fs::create_dir_all(&media).unwrap();
        let layout = WorkLayout::new(temp_dir.path().join("Data"));
        layout.ensure().unwrap();

        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        let transcoder = FakeTranscoder::new(behavior);
        let probe: Arc<dyn MediaProbe> = Arc::new(SameVideoProbe);
        let ctx = JobContext {
            catalog: catalog.clone(),
            transcoder: transcoder.clone(),
            probe: probe.clone(),
            validator: Validator::new(probe, Tolerances::default(), 3),
            bus: StatusBus::new(),
            layout: layout.clone(),
            indexer_root: media.clone(),
            settings: SchedulerSettings {
                poll_interval: Duration::from_millis(10),
                file_ready_backoff: Duration::from_millis(10),
                trash_keep: 2,
            },
        };
        let scheduler = Arc::new(Scheduler::new(ctx, CancelHandle::new()));
        Fixture { _temp_dir: temp_dir, media, layout, catalog, transcoder, scheduler }
    }

    pub(crate) fn add_video(f: &Fixture, name: &str, bytes: usize) -> VideoRecord {
        let path = f.media.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![7u8; bytes]).unwrap();
        let mut record = VideoRecord::new(
            path.parent().unwrap().to_path_buf(),
            path.file_name().unwrap().to_string_lossy().into_owned(),
            bytes as u64,
            0,
        );
        record.duration_seconds = Some(60.0);
        record.width = Some(1280);
        record.height = Some(720);
        record.fps = Some(30.0);
        assert!(f.catalog.insert(&record).unwrap());
        record
    }

    fn status(f: &Fixture, id: &Uuid) -> Status {
        f.catalog.get(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_accepted_job_replaces_original() {
        let f = fixture(Behavior::Write(100));
        let record = add_video(&f, "shows/clip.mkv", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();

        let tick = f.scheduler.tick().await.unwrap();
        assert_eq!(tick, Tick::Ran(JobOutcome::Committed { bytes_saved: 900 }));

        let stored = f.catalog.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, Status::Compressed);
        assert_eq!(stored.filename, "clip.mp4");
        assert_eq!(stored.size_compressed, Some(100));
        assert_eq!(stored.size_original, 1000);

        assert!(!f.media.join("shows/clip.mkv").exists());
        assert_eq!(std::fs::metadata(f.media.join("shows/clip.mp4")).unwrap().len(), 100);
        assert!(f.layout.trash.join("shows/clip.mkv").exists());
        assert_eq!(std::fs::read_dir(&f.layout.temp).unwrap().count(), 0);

        let snapshot = f.scheduler.bus().snapshot();
        assert_eq!(snapshot.completed_jobs, 1);
        assert!(!snapshot.is_running);
    }

    #[tokio::test]
    async fn test_bigger_output_keeps_original() {
        let f = fixture(Behavior::Write(2000));
        let record = add_video(&f, "clip.mp4", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Ran(JobOutcome::Rejected));
        assert_eq!(status(&f, &record.id), Status::Bigger);
        assert_eq!(std::fs::metadata(f.media.join("clip.mp4")).unwrap().len(), 1000);
        assert_eq!(f.catalog.get(&record.id).unwrap().unwrap().size_compressed, None);
    }

    #[tokio::test]
    async fn test_encode_failure_writes_report() {
        let f = fixture(Behavior::Fail);
        let record = add_video(&f, "broken.mkv", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Ran(JobOutcome::Failed));
        assert_eq!(status(&f, &record.id), Status::FailedToCompress);
        assert!(f.media.join("broken.mkv").exists());

        let report: serde_json::Value = serde_json::from_slice(
            &std::fs::read(f.layout.reports_dir().join("broken_report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["reason"], "failed to encode");
        assert_eq!(report["original"]["size_bytes"], 1000);
        assert_eq!(report["original"]["duration_secs"], 60.0);
        assert_eq!(report["original"]["width"], 1280);
        assert_eq!(report["candidate"]["duration_secs"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_missing_source_fails_job() {
        let f = fixture(Behavior::Write(10));
        let record = add_video(&f, "vanished.mkv", 1000);
        std::fs::remove_file(f.media.join("vanished.mkv")).unwrap();
        f.scheduler.enqueue(&[record.id]).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Ran(JobOutcome::Failed));
        assert_eq!(status(&f, &record.id), Status::FailedToCompress);
        assert_eq!(f.transcoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_source_fails_without_stalling() {
        let f = fixture(Behavior::Write(10));
        let empty = add_video(&f, "empty.mkv", 0);
        let next = add_video(&f, "next.mkv", 1000);
        f.scheduler.enqueue(&[empty.id, next.id]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), f.scheduler.tick())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Tick::Ran(JobOutcome::Failed));
        assert_eq!(status(&f, &empty.id), Status::FailedToCompress);
        assert_eq!(f.transcoder.calls.load(Ordering::SeqCst), 0);

        let second = f.scheduler.tick().await.unwrap();
        assert_eq!(second, Tick::Ran(JobOutcome::Committed { bytes_saved: 990 }));
        assert_eq!(status(&f, &next.id), Status::Compressed);
    }

    #[tokio::test]
    async fn test_recover_requeues_processing() {
        let f = fixture(Behavior::Write(10));
        let record = add_video(&f, "stuck.mkv", 1000);
        f.scheduler.enqueue(&[record.id]).unwrap();
        f.catalog.claim_next().unwrap();

        assert_eq!(f.scheduler.recover().unwrap(), 1);
        assert_eq!(status(&f, &record.id), Status::ToProcess);
    }

    #[tokio::test]
    async fn test_idle_tick() {
        let f = fixture(Behavior::Write(10));
        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn test_cancel_mid_encode_reverts_whole_batch() {
        let f = fixture(Behavior::WaitForCancel);
        let a = add_video(&f, "a.mkv", 1000);
        let b = add_video(&f, "b.mkv", 1000);
        let c = add_video(&f, "c.mkv", 1000);
        f.scheduler.enqueue(&[a.id, b.id, c.id]).unwrap();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&f.scheduler).run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), f.transcoder.started.notified())
            .await
            .unwrap();
        assert_eq!(status(&f, &a.id), Status::Processing);
        f.scheduler.request_cancel();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let all_original = [a.id, b.id, c.id]
                    .iter()
                    .all(|id| status(&f, id) == Status::Original);
                if all_original && !f.scheduler.bus().snapshot().is_running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(f.media.join("a.mkv").exists());
        assert_eq!(f.transcoder.calls.load(Ordering::SeqCst), 1);

        // A fresh token lets new work through.
        f.scheduler.enqueue(&[b.id]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), f.transcoder.started.notified())
            .await
            .unwrap();
        assert_eq!(status(&f, &b.id), Status::Processing);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_idle_clears_queue() {
        let f = fixture(Behavior::Write(10));
        let a = add_video(&f, "a.mkv", 1000);
        f.scheduler.enqueue(&[a.id]).unwrap();
        f.scheduler.request_cancel();

        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Aborted(1));
        assert_eq!(status(&f, &a.id), Status::Original);
        assert_eq!(f.scheduler.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn test_enqueue_over_threshold() {
        let f = fixture(Behavior::Write(10));
        let fat = add_video(&f, "fat.mkv", 10_000_000);
        let lean = add_video(&f, "lean.mkv", 1_000);

        let queued = f
            .scheduler
            .enqueue_over_threshold(0.1, 100, Duration::from_secs(0))
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(status(&f, &fat.id), Status::ToProcess);
        assert_eq!(status(&f, &lean.id), Status::Original);
    }

    #[tokio::test]
    async fn test_enqueue_over_threshold_with_huge_age_selects_nothing() {
        let f = fixture(Behavior::Write(10));
        let fat = add_video(&f, "fat.mkv", 10_000_000);

        let queued = f
            .scheduler
            .enqueue_over_threshold(0.1, 100, Duration::MAX)
            .unwrap();
        assert_eq!(queued, 0);
        assert_eq!(status(&f, &fat.id), Status::Original);
    }

    #[tokio::test]
    async fn test_keep_and_reset() {
        let f = fixture(Behavior::Write(10));
        let record = add_video(&f, "x.mkv", 1000);

        assert_eq!(f.scheduler.keep(&record.id).unwrap().status, Status::Kept);
        assert_eq!(f.scheduler.reset(&record.id).unwrap().status, Status::Original);

        f.scheduler.enqueue(&[record.id]).unwrap();
        f.catalog.claim_next().unwrap();
        assert!(matches!(f.scheduler.keep(&record.id), Err(ActionError::Busy(_))));
        assert!(matches!(f.scheduler.reset(&Uuid::new_v4()), Err(ActionError::NotFound(_))));
    }
}
