//! Embedded ACID store for `Job` rows.
//!
//! Backed by a single SQLite file opened in WAL mode. `claim_one` is the
//! pivotal primitive: one atomic `UPDATE ... RETURNING` statement picks the
//! highest-priority pending row (tying on earliest `submit_time`) and flips
//! it to `running`, so concurrent callers serialize on SQLite's writer lock
//! and no two of them can claim the same row.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::{Result, SchedError};
use crate::job::{Job, JobState};

/// Optional filter accepted by `Store::query` / `Scheduler::list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub user: Option<String>,
    pub limit: Option<i64>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_queue (
    job_id          TEXT PRIMARY KEY,
    job_name        TEXT,
    command         TEXT NOT NULL,
    working_dir     TEXT,
    cpus            INTEGER NOT NULL DEFAULT 1,
    memory          TEXT,
    timeout_seconds INTEGER,
    priority        INTEGER NOT NULL DEFAULT 0,
    user            TEXT NOT NULL,
    state           TEXT NOT NULL,
    return_code     INTEGER,
    stdout_path     TEXT,
    stderr_path     TEXT,
    submit_time     TEXT NOT NULL,
    start_time      TEXT,
    end_time        TEXT,
    worker_id       TEXT,
    pid             INTEGER,
    error_message   TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_queue_claim
    ON job_queue (state, priority DESC, submit_time ASC);

-- Reserved, unpopulated tables kept for forward compatibility with the
-- source schema. Neither is read or written by this implementation.
CREATE TABLE IF NOT EXISTS worker_nodes (
    worker_id TEXT PRIMARY KEY,
    hostname  TEXT,
    last_seen TEXT
);

CREATE TABLE IF NOT EXISTS resource_usage (
    job_id        TEXT,
    sampled_at    TEXT,
    cpu_percent   REAL,
    memory_bytes  INTEGER
);
"#;

/// Embedded single-file store for the job queue.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the SQLite file at `path` and run schema setup.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(SchedError::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store, isolated per connection pool. Used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(SchedError::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new job row, returning its assigned id.
    pub async fn insert(&self, job: &Job) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (
                job_id, job_name, command, working_dir, cpus, memory,
                timeout_seconds, priority, user, state, return_code,
                stdout_path, stderr_path, submit_time, start_time, end_time,
                worker_id, pid, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.job_name)
        .bind(&job.command)
        .bind(&job.working_dir)
        .bind(job.cpus)
        .bind(&job.memory)
        .bind(job.timeout_seconds)
        .bind(job.priority)
        .bind(&job.user)
        .bind(job.state.as_str())
        .bind(job.return_code)
        .bind(&job.stdout_path)
        .bind(&job.stderr_path)
        .bind(job.submit_time)
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(&job.worker_id)
        .bind(job.pid)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;

        Ok(job.job_id.clone())
    }

    /// Fetch one job by id, if present.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, Job>("SELECT * FROM job_queue WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Apply a full-row replace for the given id. Returns `false` if no row matched.
    pub async fn update(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue SET
                job_name = ?, command = ?, working_dir = ?, cpus = ?, memory = ?,
                timeout_seconds = ?, priority = ?, user = ?, state = ?, return_code = ?,
                stdout_path = ?, stderr_path = ?, submit_time = ?, start_time = ?,
                end_time = ?, worker_id = ?, pid = ?, error_message = ?
            WHERE job_id = ?
            "#,
        )
        .bind(&job.job_name)
        .bind(&job.command)
        .bind(&job.working_dir)
        .bind(job.cpus)
        .bind(&job.memory)
        .bind(job.timeout_seconds)
        .bind(job.priority)
        .bind(&job.user)
        .bind(job.state.as_str())
        .bind(job.return_code)
        .bind(&job.stdout_path)
        .bind(&job.stderr_path)
        .bind(job.submit_time)
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(&job.worker_id)
        .bind(job.pid)
        .bind(&job.error_message)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a row unconditionally (callers enforce the terminal-state rule).
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Filtered query, ordered by descending `submit_time`.
    pub async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM job_queue WHERE 1 = 1");
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.user.is_some() {
            sql.push_str(" AND user = ?");
        }
        sql.push_str(" ORDER BY submit_time DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, Job>(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(user) = &filter.user {
            query = query.bind(user);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Count jobs grouped by state.
    pub async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) as n FROM job_queue GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let state_str: String = row.try_get("state").map_err(SchedError::from)?;
                let count: i64 = row.try_get("n").map_err(SchedError::from)?;
                Ok((JobState::parse(&state_str)?, count))
            })
            .collect()
    }

    /// Atomically claim the highest-priority pending row (tie-break earliest
    /// `submit_time`), flipping it to `running` with `worker_id` and
    /// `start_time = now`. Returns `None` without side effect if no row is
    /// eligible. Under N concurrent callers and M pending rows, exactly
    /// `min(N, M)` distinct rows are ever returned.
    pub async fn claim_one(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Job>(
            r#"
            UPDATE job_queue
            SET state = 'running', worker_id = ?, start_time = ?
            WHERE job_id = (
                SELECT job_id FROM job_queue
                WHERE state = 'pending'
                ORDER BY priority DESC, submit_time ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Delete rows whose state is in `states` and whose `end_time` (if any) is
    /// older than `cutoff`. Never touches non-terminal rows. Returns the
    /// number of rows deleted.
    pub async fn delete_older_than(
        &self,
        states: &[JobState],
        cutoff: Option<chrono::DateTime<Utc>>,
    ) -> Result<u64> {
        if states.is_empty() {
            return Ok(0);
        }
        let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut sql = format!("DELETE FROM job_queue WHERE state IN ({placeholders})");
        if cutoff.is_some() {
            sql.push_str(" AND end_time IS NOT NULL AND end_time < ?");
        }

        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        if let Some(cutoff) = cutoff {
            query = query.bind(cutoff);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// All rows currently `running`, used by the worker pool's orphan sweep.
    pub async fn running_jobs(&self) -> Result<Vec<Job>> {
        Ok(
            sqlx::query_as::<_, Job>("SELECT * FROM job_queue WHERE state = 'running'")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SubmitRequest;
    use std::collections::HashSet;

    fn new_job(req: &SubmitRequest, user: &str) -> Job {
        Job {
            job_id: uuid_like(),
            job_name: req.job_name.clone(),
            command: req.command.clone(),
            working_dir: req.working_dir.clone(),
            cpus: req.cpus.unwrap_or(1),
            memory: req.memory.clone(),
            timeout_seconds: req.timeout_seconds,
            priority: req.priority.unwrap_or(0),
            user: user.to_string(),
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
        }
    }

    // A store-local stand-in for job_id generation; Scheduler owns the real one.
    fn uuid_like() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        format!("job-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let job = new_job(&SubmitRequest::new("echo hi"), "alice");
        store.insert(&job).await.unwrap();

        let fetched = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(fetched.command, "echo hi");
        assert_eq!(fetched.user, "alice");
        assert_eq!(fetched.state, JobState::Pending);
    }

    #[tokio::test]
    async fn claim_one_returns_none_when_empty() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.claim_one("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_one_picks_highest_priority_then_earliest_submit() {
        let store = Store::open_in_memory().await.unwrap();

        let mut a = new_job(&SubmitRequest::new("a"), "alice");
        a.priority = 1;
        a.submit_time = Utc::now() - chrono::Duration::seconds(30);
        store.insert(&a).await.unwrap();

        let mut b = new_job(&SubmitRequest::new("b"), "alice");
        b.priority = 5;
        b.submit_time = Utc::now() - chrono::Duration::seconds(20);
        store.insert(&b).await.unwrap();

        let mut c = new_job(&SubmitRequest::new("c"), "alice");
        c.priority = 5;
        c.submit_time = Utc::now() - chrono::Duration::seconds(10);
        store.insert(&c).await.unwrap();

        let first = store.claim_one("w1").await.unwrap().unwrap();
        assert_eq!(first.job_id, b.job_id);

        let second = store.claim_one("w1").await.unwrap().unwrap();
        assert_eq!(second.job_id, c.job_id);

        let third = store.claim_one("w1").await.unwrap().unwrap();
        assert_eq!(third.job_id, a.job_id);
    }

    #[tokio::test]
    async fn claim_one_never_returns_the_same_row_twice_concurrently() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..10 {
            let mut job = new_job(&SubmitRequest::new(format!("echo {i}")), "alice");
            job.priority = i;
            store.insert(&job).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..15 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_one(&format!("worker-{i}")).await.unwrap()
            }));
        }

        let mut claimed = HashSet::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                assert!(claimed.insert(job.job_id), "row claimed twice");
            }
        }
        assert_eq!(claimed.len(), 10);
    }

    #[tokio::test]
    async fn delete_older_than_is_monotone() {
        let store = Store::open_in_memory().await.unwrap();
        let mut job = new_job(&SubmitRequest::new("echo hi"), "alice");
        job.state = JobState::Completed;
        job.end_time = Some(Utc::now() - chrono::Duration::days(2));
        store.insert(&job).await.unwrap();

        let first = store
            .delete_older_than(&[JobState::Completed], Some(Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = store
            .delete_older_than(&[JobState::Completed], Some(Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn running_jobs_lists_only_running_rows() {
        let store = Store::open_in_memory().await.unwrap();
        let mut running = new_job(&SubmitRequest::new("sleep 30"), "alice");
        running.state = JobState::Running;
        running.worker_id = Some("w1".into());
        running.pid = Some(1234);
        store.insert(&running).await.unwrap();

        let pending = new_job(&SubmitRequest::new("echo hi"), "alice");
        store.insert(&pending).await.unwrap();

        let rows = store.running_jobs().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, running.job_id);
    }
}
