//! Sleep prevention while a job is running.

use crate::bus::StatusSnapshot;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// OS capability to keep the machine awake.
pub trait SleepInhibitor: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

/// For platforms without an inhibitor.
#[derive(Debug, Default)]
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn acquire(&mut self) {}
    fn release(&mut self) {}
}

/// Holds a `systemd-inhibit --what=sleep` child while acquired.
#[derive(Debug, Default)]
pub struct SystemdInhibitor {
    child: Option<Child>,
}

impl SystemdInhibitor {
    /// Returns an inhibitor if `systemd-inhibit` is on this host.
    pub fn detect() -> Option<Self> {
        let found = std::process::Command::new("systemd-inhibit")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        found.then(Self::default)
    }
}

impl SleepInhibitor for SystemdInhibitor {
    fn acquire(&mut self) {
        if self.child.is_some() {
            return;
        }
        let spawned = Command::new("systemd-inhibit")
            .args([
                "--what=sleep",
                "--who=squeeze",
                "--why=Re-encoding video",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                debug!("Sleep inhibited");
                self.child = Some(child);
            }
            Err(e) => warn!(error = %e, "Failed to inhibit sleep"),
        }
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to release sleep inhibitor");
            }
            debug!("Sleep allowed");
        }
    }
}

/// Best inhibitor available on this host.
pub fn platform_inhibitor() -> Box<dyn SleepInhibitor> {
    match SystemdInhibitor::detect() {
        Some(inhibitor) => Box::new(inhibitor),
        None => {
            info!("systemd-inhibit not available, sleep prevention disabled");
            Box::new(NoopInhibitor)
        }
    }
}

/// Follows `is_running` and toggles the inhibitor on edges only. Ends when
/// the bus is dropped.
pub async fn follow_running(
    mut rx: watch::Receiver<StatusSnapshot>,
    mut inhibitor: Box<dyn SleepInhibitor>,
) {
    let mut active = false;
    loop {
        let running = rx.borrow_and_update().is_running;
        if running != active {
            if running {
                inhibitor.acquire();
            } else {
                inhibitor.release();
            }
            active = running;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    if active {
        inhibitor.release();
    }
}
