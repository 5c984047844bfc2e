//! The worker pool: a fixed-size group of long-running workers that poll the
//! scheduler for claimable jobs, spawn subprocesses, enforce timeouts, and
//! record results.
//!
//! Each worker runs as its own `tokio` task inside a `JoinSet`; a shutdown
//! `CancellationToken` owned by the pool is handed down to every worker and,
//! per running job, a child token further down to that job's supervision
//! loop — the same token-tree shape this codebase uses for its background
//! job worker, adapted from command dispatch to subprocess supervision.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::job::{Job, JobState};
use crate::procguard::{self, Signal};
use crate::scheduler::Scheduler;

/// Grace window between SIGTERM and SIGKILL on timeout/cancel (§4.3 step 6).
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on how often the supervision loop checks for a cancel mark.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Directory under which default stdout/stderr files are created when a
    /// job does not specify its own paths.
    pub log_dir: PathBuf,
}

impl WorkerPoolConfig {
    pub fn new(max_workers: usize, log_dir: PathBuf) -> Self {
        Self {
            max_workers: max_workers.max(1),
            poll_interval: Duration::from_secs(1),
            log_dir,
        }
    }
}

/// Point-in-time status of one worker, reported by `Service::status` and
/// `worker_status()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub current_job_id: Option<String>,
    #[serde(skip)]
    pub claimed_at: Option<std::time::Instant>,
}

impl WorkerStatus {
    fn idle(worker_id: String) -> Self {
        Self {
            worker_id,
            current_job_id: None,
            claimed_at: None,
        }
    }
}

type StatusMap = Arc<Mutex<HashMap<String, WorkerStatus>>>;

/// A fixed-size pool of workers sharing one scheduler.
pub struct WorkerPool {
    scheduler: Scheduler,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    statuses: StatusMap,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(scheduler: Scheduler, config: WorkerPoolConfig) -> Self {
        Self {
            scheduler,
            config,
            shutdown: CancellationToken::new(),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(None),
        }
    }

    /// Sweeps orphaned `running` rows, then launches `max_workers` long-lived
    /// workers. Idempotent to call once; calling twice without `stop` first
    /// replaces the task set (callers should not do this).
    pub async fn start(&self) -> Result<usize> {
        let orphaned = self.sweep_orphans().await?;
        if orphaned > 0 {
            warn!(count = orphaned, "failed orphaned running jobs at startup");
        }

        let mut join_set = JoinSet::new();
        let mut statuses = self.statuses.lock().await;
        statuses.clear();

        for i in 0..self.config.max_workers {
            let worker_id = format!("worker-{}-{}", std::process::id(), i);
            statuses.insert(worker_id.clone(), WorkerStatus::idle(worker_id.clone()));

            let scheduler = self.scheduler.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown.child_token();
            let statuses_handle = self.statuses.clone();

            join_set.spawn(async move {
                worker_loop(worker_id, scheduler, config, shutdown, statuses_handle).await;
            });
        }
        drop(statuses);

        *self.tasks.lock().await = Some(join_set);
        info!(workers = self.config.max_workers, "worker pool started");
        Ok(self.config.max_workers)
    }

    /// Any row found `running` at startup has no live owner (this is a fresh
    /// process; no worker has claimed anything yet) and is failed per §4.3's
    /// mandated "fail, not requeue" policy. Returns the number swept.
    async fn sweep_orphans(&self) -> Result<usize> {
        let running = self.scheduler.running_jobs().await?;
        for job in &running {
            self.scheduler
                .update_job_state(
                    &job.job_id,
                    JobState::Failed,
                    Some(-1),
                    Some("orphaned by restart".to_string()),
                    None,
                )
                .await?;
        }
        Ok(running.len())
    }

    /// Requests termination. With `drain`, waits (up to `timeout`, default
    /// 30s) for in-flight workers to finish their current job before
    /// returning; without it, cancels and returns once the shutdown signal
    /// has been raised, without waiting for worker tasks to join.
    pub async fn stop(&self, drain: bool, timeout: Option<Duration>) -> Result<()> {
        self.shutdown.cancel();

        if !drain {
            return Ok(());
        }

        let timeout = timeout.unwrap_or(Duration::from_secs(30));
        let mut guard = self.tasks.lock().await;
        if let Some(join_set) = guard.as_mut() {
            let drained = tokio::time::timeout(timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("drain timeout elapsed with workers still running");
            }
        }
        Ok(())
    }

    /// Current status of every worker slot.
    pub async fn worker_status(&self) -> Vec<WorkerStatus> {
        self.statuses.lock().await.values().cloned().collect()
    }
}

async fn worker_loop(
    worker_id: String,
    scheduler: Scheduler,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    statuses: StatusMap,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let claim = scheduler.claim_next(&worker_id).await;
        let job = match claim {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "claim_next failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        {
            let mut map = statuses.lock().await;
            if let Some(status) = map.get_mut(&worker_id) {
                status.current_job_id = Some(job.job_id.clone());
                status.claimed_at = Some(std::time::Instant::now());
            }
        }

        if let Err(e) = run_job(&worker_id, &scheduler, &config, job, &shutdown).await {
            error!(worker_id = %worker_id, error = %e, "job execution failed unexpectedly");
        }

        let mut map = statuses.lock().await;
        if let Some(status) = map.get_mut(&worker_id) {
            status.current_job_id = None;
            status.claimed_at = None;
        }
    }

    debug!(worker_id = %worker_id, "worker stopped");
}

/// Steps 3-7 of §4.3: open log files, spawn in a new process group, record
/// the pid, supervise to a terminal state.
async fn run_job(
    worker_id: &str,
    scheduler: &Scheduler,
    config: &WorkerPoolConfig,
    job: Job,
    shutdown: &CancellationToken,
) -> Result<()> {
    let job_id = job.job_id.clone();

    let stdout_path = job
        .stdout_path
        .clone()
        .unwrap_or_else(|| default_log_path(&config.log_dir, &job_id, "out"));
    let stderr_path = job
        .stderr_path
        .clone()
        .unwrap_or_else(|| default_log_path(&config.log_dir, &job_id, "err"));

    if let Some(parent) = std::path::Path::new(&stdout_path).parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }

    let stdout_file = match std::fs::File::create(&stdout_path) {
        Ok(f) => f,
        Err(e) => {
            return fail_spawn(scheduler, &job_id, format!("failed to open stdout file: {e}")).await;
        }
    };
    let stderr_file = match std::fs::File::create(&stderr_path) {
        Ok(f) => f,
        Err(e) => {
            return fail_spawn(scheduler, &job_id, format!("failed to open stderr file: {e}")).await;
        }
    };

    let mut command = Command::new("sh");
    command.arg("-c").arg(&job.command);
    if let Some(dir) = &job.working_dir {
        command.current_dir(dir);
    }
    command.stdout(Stdio::from(stdout_file));
    command.stderr(Stdio::from(stderr_file));
    command.stdin(Stdio::null());

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| procguard::set_process_group());
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            return fail_spawn(scheduler, &job_id, format!("{e}")).await;
        }
    };

    let pid = child.id().map(|p| p as i64);
    if let Some(pid) = pid {
        scheduler.record_pid(&job_id, pid).await?;
    }

    debug!(worker_id = %worker_id, job_id = %job_id, pid = ?pid, "job spawned");

    let outcome = supervise(scheduler, &job, &mut child, pid, shutdown).await;
    apply_outcome(scheduler, &job_id, outcome).await
}

enum Outcome {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Step 6: wait on `{child exit, timeout deadline, cancel-mark poll}`.
async fn supervise(
    scheduler: &Scheduler,
    job: &Job,
    child: &mut tokio::process::Child,
    pid: Option<i64>,
    _pool_shutdown: &CancellationToken,
) -> Outcome {
    let deadline = job
        .timeout_seconds
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs as u64));
    let mut cancel_tick = tokio::time::interval(CANCEL_POLL_INTERVAL);

    loop {
        let sleep_until_deadline = async {
            match deadline {
                Some(when) => tokio::time::sleep_until(when).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                let code = status
                    .ok()
                    .and_then(|s| s.code())
                    .map(|c| c as i64)
                    .unwrap_or(-1);
                return Outcome::Exited(code);
            }
            _ = sleep_until_deadline => {
                if let Some(pid) = pid {
                    kill_with_grace(pid).await;
                }
                let _ = child.wait().await;
                return Outcome::TimedOut;
            }
            _ = cancel_tick.tick() => {
                if let Ok(Some(current)) = scheduler.get_job_status(&job.job_id).await {
                    if current.state == JobState::Cancelled {
                        if let Some(pid) = pid {
                            kill_with_grace(pid).await;
                        }
                        let _ = child.wait().await;
                        return Outcome::Cancelled;
                    }
                }
            }
        }
    }
}

async fn kill_with_grace(pid: i64) {
    let _ = procguard::signal_process_group(pid, Signal::Terminate);
    tokio::time::sleep(KILL_GRACE).await;
    let _ = procguard::signal_process_group(pid, Signal::Kill);
}

async fn apply_outcome(scheduler: &Scheduler, job_id: &str, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Exited(code) => {
            let state = if code == 0 {
                JobState::Completed
            } else {
                JobState::Failed
            };
            scheduler
                .update_job_state(job_id, state, Some(code), None, None)
                .await
        }
        Outcome::TimedOut => {
            scheduler
                .update_job_state(job_id, JobState::Timeout, Some(-1), None, None)
                .await
        }
        Outcome::Cancelled => {
            scheduler
                .update_job_state(job_id, JobState::Cancelled, Some(-1), None, None)
                .await
        }
    }
}

async fn fail_spawn(scheduler: &Scheduler, job_id: &str, message: String) -> Result<()> {
    scheduler
        .update_job_state(job_id, JobState::Failed, Some(-1), Some(message), None)
        .await
}

fn default_log_path(log_dir: &std::path::Path, job_id: &str, ext: &str) -> String {
    log_dir.join(format!("{job_id}.{ext}")).to_string_lossy().into_owned()
}
