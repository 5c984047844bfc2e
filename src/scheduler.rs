//! The scheduler: the only mutator of `Job` state, and the sole public API
//! surface the CLI and library callers are meant to use. Workers touch state
//! only through `claim_next` and `update_job_state`.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SchedError};
use crate::job::{Job, JobState, SubmitRequest};
use crate::store::{JobFilter, Store};

/// `job_id` must stay unique and (per §3) monotonic within a store across
/// the lifetime of many short-lived CLI processes, not just within one —
/// each `schedarray submit` invocation is its own process. A UUIDv7 is
/// time-ordered and globally unique without a round trip to the store,
/// which a process-local counter can't offer (it would restart at 1 on
/// every launch). Mirrors this codebase's `common_rs::id::Id<T, V7>`
/// convention for entity ids.
fn next_job_id() -> String {
    format!("job-{}", Uuid::now_v7())
}

fn current_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Public API over the `Store`. Cheap to clone (wraps an `Arc`-backed
/// connection pool internally); a process constructs one and hands clones to
/// the CLI, the worker pool, and the service.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Validates, defaults, and inserts a new job in `pending`.
    pub async fn submit_job(&self, req: SubmitRequest) -> Result<String> {
        req.validate()?;

        let working_dir = req.working_dir.clone().or_else(|| {
            env::current_dir()
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        });

        let job = Job {
            job_id: next_job_id(),
            job_name: req.job_name.clone(),
            command: req.command.clone(),
            working_dir,
            cpus: req.cpus.unwrap_or(1),
            memory: req.memory.clone(),
            timeout_seconds: req.timeout_seconds,
            priority: req.priority.unwrap_or(0),
            user: current_user(),
            state: JobState::Pending,
            return_code: None,
            stdout_path: req.output_path.clone(),
            stderr_path: req.error_path.clone(),
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            worker_id: None,
            pid: None,
            error_message: None,
        };

        let job_id = self.store.insert(&job).await?;
        info!(job_id = %job_id, priority = job.priority, "job submitted");
        Ok(job_id)
    }

    /// Pure read; returns all fields.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }

    /// `pending -> cancelled` is immediate; `running -> cancelled` sets a mark
    /// that the owning worker confirms later (see §5). Idempotent: returns
    /// `false` if the job is already terminal or unknown.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(false);
        };

        match job.state {
            JobState::Pending => {
                job.state = JobState::Cancelled;
                job.end_time = Some(Utc::now());
                self.store.update(&job).await?;
                info!(job_id = %job_id, "cancelled pending job");
                Ok(true)
            }
            JobState::Running => {
                job.state = JobState::Cancelled;
                // end_time is deferred: the worker sets it once the subprocess
                // has actually been killed and reaped.
                self.store.update(&job).await?;
                info!(job_id = %job_id, "marked running job for cancellation");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Filtered query ordered by descending `submit_time`.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.store.query(&filter).await
    }

    /// Counts grouped by state; states with zero jobs are included as 0 for a
    /// stable JSON shape.
    pub async fn count_by_state(&self) -> Result<HashMap<String, i64>> {
        let mut counts: HashMap<String, i64> = [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
        ]
        .into_iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

        for (state, n) in self.store.count_by_state().await? {
            counts.insert(state.as_str().to_string(), n);
        }
        Ok(counts)
    }

    /// Refuses to delete pending/running jobs.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(false);
        };
        if !job.state.is_terminal() {
            return Err(SchedError::IllegalTransition(format!(
                "cannot delete job {job_id} in state {}",
                job.state.as_str()
            )));
        }
        self.store.delete(job_id).await
    }

    /// Bulk delete of terminal rows older than `older_than_days`, if given.
    /// Never touches non-terminal rows (only terminal states are accepted).
    pub async fn cleanup(&self, states: &[JobState], older_than_days: Option<i64>) -> Result<u64> {
        for state in states {
            if !state.is_terminal() {
                return Err(SchedError::Validation(format!(
                    "cleanup only accepts terminal states, got {}",
                    state.as_str()
                )));
            }
        }
        let cutoff = older_than_days.map(|days| Utc::now() - chrono::Duration::days(days));
        self.store.delete_older_than(states, cutoff).await
    }

    /// Internal: used by the worker pool only. Delegates to `Store::claim_one`.
    pub(crate) async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        self.store.claim_one(worker_id).await
    }

    /// Internal: enforces the legal transition DAG before persisting.
    pub(crate) async fn update_job_state(
        &self,
        job_id: &str,
        new_state: JobState,
        return_code: Option<i64>,
        error_message: Option<String>,
        pid: Option<i64>,
    ) -> Result<()> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Err(SchedError::NotFound(job_id.to_string()));
        };

        if job.state != new_state && !job.state.can_transition_to(new_state) {
            return Err(SchedError::IllegalTransition(format!(
                "cannot transition job {job_id} from {} to {}",
                job.state.as_str(),
                new_state.as_str()
            )));
        }

        let from = job.state;
        job.state = new_state;
        if let Some(code) = return_code {
            job.return_code = Some(code);
        }
        if let Some(msg) = error_message {
            job.error_message = Some(msg);
        }
        if pid.is_some() {
            job.pid = pid;
        }
        if new_state.is_terminal() {
            job.end_time.get_or_insert(Utc::now());
            job.pid = None;
            job.worker_id = None;
        }

        self.store.update(&job).await?;
        info!(job_id = %job_id, from = from.as_str(), to = new_state.as_str(), "state transition");
        Ok(())
    }

    /// Internal: recorded mid-flight when a worker has spawned the child but
    /// the job has not yet reached a terminal state.
    pub(crate) async fn record_pid(&self, job_id: &str, pid: i64) -> Result<()> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Err(SchedError::NotFound(job_id.to_string()));
        };
        job.pid = Some(pid);
        self.store.update(&job).await?;
        Ok(())
    }

    /// All rows currently `running`; used by the worker pool's orphan sweep.
    pub(crate) async fn running_jobs(&self) -> Result<Vec<Job>> {
        self.store.running_jobs().await
    }
}
