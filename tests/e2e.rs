//! End-to-end scenarios exercising the scheduler, store, and worker pool
//! together against a real (tempfile-backed) SQLite database.

use std::time::Duration;

use schedarray_core::{JobState, Scheduler, Store, SubmitRequest, WorkerPool, WorkerPoolConfig};

async fn scheduler_with_file_store(dir: &std::path::Path) -> Scheduler {
    let db_path = dir.join("jobs.db");
    let store = Store::open(&db_path.to_string_lossy()).await.unwrap();
    Scheduler::new(store)
}

async fn wait_for_terminal(scheduler: &Scheduler, job_id: &str) -> schedarray_core::Job {
    let mut job = scheduler.get_job_status(job_id).await.unwrap().unwrap();
    for _ in 0..100 {
        if job.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        job = scheduler.get_job_status(job_id).await.unwrap().unwrap();
    }
    job
}

#[tokio::test]
async fn happy_path_submit_run_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = scheduler_with_file_store(tmp.path()).await;
    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(2, tmp.path().join("logs")));

    let id = scheduler
        .submit_job(SubmitRequest::new("echo hello-e2e"))
        .await
        .unwrap();

    pool.start().await.unwrap();
    let job = wait_for_terminal(&scheduler, &id).await;
    pool.stop(true, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_code, Some(0));
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());
    assert!(job.start_time.unwrap() <= job.end_time.unwrap());
    let stdout = std::fs::read_to_string(job.stdout_path.unwrap()).unwrap();
    assert_eq!(stdout, "hello-e2e\n");
}

#[tokio::test]
async fn higher_priority_jobs_run_first_with_a_single_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = scheduler_with_file_store(tmp.path()).await;
    // A single worker makes claim order directly observable via start_time.
    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(1, tmp.path().join("logs")));

    let mut low = SubmitRequest::new("sleep 0.2");
    low.priority = Some(1);
    let low_id = scheduler.submit_job(low).await.unwrap();

    let mut high = SubmitRequest::new("sleep 0.2");
    high.priority = Some(10);
    let high_id = scheduler.submit_job(high).await.unwrap();

    pool.start().await.unwrap();
    let high_job = wait_for_terminal(&scheduler, &high_id).await;
    let low_job = wait_for_terminal(&scheduler, &low_id).await;
    pool.stop(true, Some(Duration::from_secs(5))).await.unwrap();

    assert!(high_job.start_time.unwrap() < low_job.start_time.unwrap());
}

#[tokio::test]
async fn cancel_pending_job_never_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = scheduler_with_file_store(tmp.path()).await;

    let id = scheduler
        .submit_job(SubmitRequest::new("echo should-not-run"))
        .await
        .unwrap();
    assert!(scheduler.cancel_job(&id).await.unwrap());

    let job = scheduler.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.start_time.is_none());
    assert!(job.return_code.is_none());

    // A worker pool starting afterwards must not pick it up.
    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(1, tmp.path().join("logs")));
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.stop(false, None).await.unwrap();

    let job = scheduler.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
}

#[tokio::test]
async fn cancel_running_job_is_terminated_within_grace_window() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = scheduler_with_file_store(tmp.path()).await;
    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(1, tmp.path().join("logs")));

    let id = scheduler
        .submit_job(SubmitRequest::new("sleep 30"))
        .await
        .unwrap();
    pool.start().await.unwrap();

    let mut job = scheduler.get_job_status(&id).await.unwrap().unwrap();
    for _ in 0..50 {
        if job.state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        job = scheduler.get_job_status(&id).await.unwrap().unwrap();
    }
    assert_eq!(job.state, JobState::Running);

    let started = std::time::Instant::now();
    scheduler.cancel_job(&id).await.unwrap();
    let job = wait_for_terminal(&scheduler, &id).await;
    pool.stop(true, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn job_exceeding_timeout_is_killed_and_marked_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = scheduler_with_file_store(tmp.path()).await;
    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(1, tmp.path().join("logs")));

    let mut req = SubmitRequest::new("sleep 30");
    req.timeout_seconds = Some(1);
    let id = scheduler.submit_job(req).await.unwrap();

    pool.start().await.unwrap();
    let job = wait_for_terminal(&scheduler, &id).await;
    pool.stop(true, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Timeout);
    assert_eq!(job.return_code, Some(-1));
}

#[tokio::test]
async fn jobs_running_before_a_restart_are_failed_as_orphaned() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("jobs.db");
    let store = Store::open(&db_path.to_string_lossy()).await.unwrap();
    let scheduler = Scheduler::new(store);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            scheduler
                .submit_job(SubmitRequest::new(format!("sleep {i}")))
                .await
                .unwrap(),
        );
    }

    // Simulate a prior process crashing mid-job: claim each row directly
    // against the database (bypassing any worker) so they sit as `running`
    // with no live owner when a fresh pool starts.
    let raw_store = Store::open(&db_path.to_string_lossy()).await.unwrap();
    for i in 0..ids.len() {
        raw_store.claim_one(&format!("dead-worker-{i}")).await.unwrap();
    }

    let pool = WorkerPool::new(scheduler.clone(), WorkerPoolConfig::new(2, tmp.path().join("logs")));
    pool.start().await.unwrap();
    pool.stop(false, None).await.unwrap();

    for id in &ids {
        let job = scheduler.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("orphaned by restart"));
    }
}
