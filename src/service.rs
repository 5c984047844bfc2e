//! Process lifecycle wrapper: a pid-file lock plus signal-driven graceful
//! shutdown around the worker pool, in the spirit of this codebase's
//! `ServiceHost`/`Service` pairing (`kernel/jobs/worker.rs`'s
//! `impl Service for JobWorker<S>`) — but concrete rather than a trait,
//! since SchedArray only ever runs one long-lived service per process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, SchedError};
use crate::procguard;
use crate::scheduler::Scheduler;
use crate::worker::{WorkerPool, WorkerStatus};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Advisory lock file, conventionally beside the database file.
    pub pid_path: PathBuf,
    /// How long `stop` waits for in-flight jobs before giving up on the drain.
    pub drain_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(pid_path: PathBuf) -> Self {
        Self {
            pid_path,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot returned by `service status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub workers: Vec<WorkerStatusReport>,
    pub counts_by_state: std::collections::HashMap<String, i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatusReport {
    pub worker_id: String,
    pub current_job_id: Option<String>,
}

impl From<WorkerStatus> for WorkerStatusReport {
    fn from(s: WorkerStatus) -> Self {
        Self {
            worker_id: s.worker_id,
            current_job_id: s.current_job_id,
        }
    }
}

/// Owns the pid-file lock and the worker pool for the lifetime of the
/// `schedarray service start` process.
pub struct Service {
    config: ServiceConfig,
    scheduler: Scheduler,
    pool: Arc<WorkerPool>,
}

impl Service {
    pub fn new(config: ServiceConfig, scheduler: Scheduler, pool: WorkerPool) -> Self {
        Self {
            config,
            scheduler,
            pool: Arc::new(pool),
        }
    }

    /// Acquires the pid lock (reclaiming a stale one left by a crashed
    /// process) and starts the worker pool. Fails with `SchedError::Validation`
    /// if another live process already holds the lock.
    pub async fn start(&self) -> Result<()> {
        self.acquire_lock()?;
        let n = self.pool.start().await?;
        info!(workers = n, pid_path = %self.config.pid_path.display(), "service started");
        Ok(())
    }

    /// Waits for SIGTERM/SIGINT (or Ctrl-C on non-Unix), then performs a
    /// graceful drain and releases the lock.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        self.stop(true).await
    }

    /// Stops the worker pool (optionally draining in-flight jobs) and
    /// releases the pid lock.
    pub async fn stop(&self, drain: bool) -> Result<()> {
        let timeout = if drain {
            Some(self.config.drain_timeout)
        } else {
            None
        };
        self.pool.stop(drain, timeout).await?;
        self.release_lock();
        info!("service stopped");
        Ok(())
    }

    /// Point-in-time status, usable whether or not this process holds the
    /// lock (reads the pid file and the scheduler's own counts).
    pub async fn status(&self) -> Result<ServiceStatus> {
        let (running, pid) = read_lock(&self.config.pid_path);
        let workers = self
            .pool
            .worker_status()
            .await
            .into_iter()
            .map(WorkerStatusReport::from)
            .collect();
        let counts_by_state = self.scheduler.count_by_state().await?;
        Ok(ServiceStatus {
            running,
            pid,
            workers,
            counts_by_state,
        })
    }

    fn acquire_lock(&self) -> Result<()> {
        let (held, holder_pid) = read_lock(&self.config.pid_path);
        if held {
            return Err(SchedError::Validation(format!(
                "service already running (pid {})",
                holder_pid.unwrap_or(0)
            )));
        }
        if holder_pid.is_some() {
            warn!(path = %self.config.pid_path.display(), "reclaiming stale pid lock");
        }
        if let Some(parent) = self.config.pid_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedError::Validation(format!("failed to create pid lock directory: {e}"))
            })?;
        }
        std::fs::write(&self.config.pid_path, std::process::id().to_string())
            .map_err(|e| SchedError::Validation(format!("failed to write pid lock: {e}")))?;
        Ok(())
    }

    fn release_lock(&self) {
        let _ = std::fs::remove_file(&self.config.pid_path);
    }
}

/// Reads `path`, returning `(true, Some(pid))` if it names a live process,
/// `(false, Some(pid))` if the lock is stale, and `(false, None)` if absent.
fn read_lock(path: &Path) -> (bool, Option<u32>) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return (false, None);
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return (false, None);
    };
    let alive = procguard::is_process_alive(pid as i64);
    (alive, Some(pid))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
