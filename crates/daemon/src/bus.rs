//! Status & cancellation bus.
//!
//! Status travels over a `tokio::sync::watch` channel: publishing never
//! waits on subscribers, and a slow subscriber only ever sees the latest
//! snapshot. Cancellation is a renewable [`CancellationToken`].

use crate::catalog::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Encode progress: a percentage, or unknown when the encoder's output
/// could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Progress {
    Percent(f32),
    Indeterminate,
}

/// Phase of the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Claimed,
    Staging,
    Encoding,
    Validating,
    Committing,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Claimed => "Claimed",
            Phase::Staging => "Copying to working directory",
            Phase::Encoding => "Encoding",
            Phase::Validating => "Validating output",
            Phase::Committing => "Replacing original",
        }
    }
}

/// What observers see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub file: Option<String>,
    pub phase: Phase,
    pub phase_label: String,
    pub progress: Option<Progress>,
    pub is_running: bool,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub total_bytes_saved: u64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            file: None,
            phase: Phase::Idle,
            phase_label: Phase::Idle.label().to_string(),
            progress: None,
            is_running: false,
            completed_jobs: 0,
            failed_jobs: 0,
            total_bytes_saved: 0,
        }
    }
}

/// How a job ended, for the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Committed { bytes_saved: u64 },
    Rejected,
    Failed,
    Cancelled,
}

/// Single-writer status channel.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_modify(|snapshot| {
            f(snapshot);
            snapshot.timestamp_unix_ms = current_timestamp_ms();
        });
    }

    /// Enters `phase` for `file`. Progress resets to none.
    pub fn phase(&self, file: &str, phase: Phase) {
        self.update(|s| {
            s.file = Some(file.to_string());
            s.phase = phase;
            s.phase_label = phase.label().to_string();
            s.progress = None;
            s.is_running = phase != Phase::Idle;
        });
    }

    pub fn progress(&self, progress: Progress) {
        self.update(|s| s.progress = Some(progress));
    }

    /// Back to idle, counting the finished job.
    pub fn finish(&self, outcome: JobOutcome) {
        self.update(|s| {
            s.file = None;
            s.phase = Phase::Idle;
            s.phase_label = Phase::Idle.label().to_string();
            s.progress = None;
            s.is_running = false;
            match outcome {
                JobOutcome::Committed { bytes_saved } => {
                    s.completed_jobs += 1;
                    s.total_bytes_saved += bytes_saved;
                }
                JobOutcome::Failed => s.failed_jobs += 1,
                JobOutcome::Rejected | JobOutcome::Cancelled => {}
            }
        });
    }
}

/// Renewable cancellation scoped to the current batch.
#[derive(Debug, Default)]
pub struct CancelHandle {
    token: Mutex<CancellationToken>,
}

impl CancelHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        // A poisoned lock still guards a valid token.
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token for work started now.
    pub fn current(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// Invalidates the current token.
    pub fn request_cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Issues a fresh token if the current one was cancelled.
    pub fn renew(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_and_progress() {
        let bus = StatusBus::new();
        bus.phase("movie.mkv", Phase::Encoding);
        bus.progress(Progress::Percent(42.0));

        let snapshot = bus.snapshot();
        assert_eq!(snapshot.file.as_deref(), Some("movie.mkv"));
        assert_eq!(snapshot.phase_label, "Encoding");
        assert_eq!(snapshot.progress, Some(Progress::Percent(42.0)));
        assert!(snapshot.is_running);
        assert!(snapshot.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_finish_counts_outcomes() {
        let bus = StatusBus::new();
        bus.phase("a.mkv", Phase::Committing);
        bus.finish(JobOutcome::Committed { bytes_saved: 100 });
        bus.finish(JobOutcome::Failed);
        bus.finish(JobOutcome::Cancelled);

        let snapshot = bus.snapshot();
        assert!(!snapshot.is_running);
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.total_bytes_saved, 100);
        assert_eq!(snapshot.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_latest_only() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();
        for i in 0..100 {
            bus.progress(Progress::Percent(i as f32));
        }
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().progress, Some(Progress::Percent(99.0)));
    }

    #[test]
    fn test_publishing_without_subscribers() {
        let bus = StatusBus::new();
        bus.progress(Progress::Indeterminate);
        assert_eq!(bus.snapshot().progress, Some(Progress::Indeterminate));
    }

    #[test]
    fn test_progress_serialization() {
        let json = serde_json::to_string(&Progress::Percent(12.5)).unwrap();
        assert_eq!(json, r#"{"kind":"percent","value":12.5}"#);
        let json = serde_json::to_string(&Progress::Indeterminate).unwrap();
        assert_eq!(json, r#"{"kind":"indeterminate"}"#);
    }

    #[test]
    fn test_cancel_handle_renewal() {
        let handle = CancelHandle::new();
        let first = handle.current();
        assert!(!first.is_cancelled());

        handle.request_cancel();
        assert!(first.is_cancelled());
        assert!(handle.is_cancelled());

        let second = handle.renew();
        assert!(!second.is_cancelled());
        assert!(!handle.is_cancelled());
        assert!(first.is_cancelled());

        // Renewing an uncancelled token keeps it.
        let third = handle.renew();
        handle.request_cancel();
        assert!(second.is_cancelled() && third.is_cancelled());
    }
}
