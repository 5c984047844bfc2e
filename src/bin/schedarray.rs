//! Command-line entry point. Subcommands map directly onto `Scheduler` and
//! `Service` methods; JSON output follows this codebase's `migrate_cli`
//! convention (a `Response`-shaped struct printed with `serde_json`), but
//! unlike that tool's always-exit-0 style, failures here produce a real
//! process exit code (0 success, 1 recoverable error, 2 usage error) per
//! the scheduler's error taxonomy.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use schedarray_core::{Config, JobFilter, JobState, Scheduler, Service, ServiceConfig, SubmitRequest};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "schedarray", version, about = "A single-host shell-command job scheduler")]
struct Cli {
    /// Overrides SCHEDARRAY_DB / the compiled-in default.
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Emit machine-readable JSON instead of plain text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new job.
    Submit {
        command: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long)]
        cpus: Option<i64>,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        timeout_seconds: Option<i64>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
    /// Show one job's full record.
    Status { job_id: String },
    /// List jobs, optionally filtered.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Cancel a pending or running job.
    Cancel { job_id: String },
    /// Delete a terminal job's record.
    Delete { job_id: String },
    /// Delete terminal jobs matching the given states.
    Cleanup {
        #[arg(long = "state", required = true)]
        states: Vec<String>,
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Counts of jobs grouped by state.
    Counts,
    /// Control the long-running worker service.
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// Start the worker pool and block until a shutdown signal arrives.
    Start,
    /// Signal a running service to stop (best-effort; sends SIGTERM).
    Stop,
    /// Report whether the service is running and what its workers are doing.
    Status,
}

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: StoreError: failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: ValidationError: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone().into();
    }

    let store = match schedarray_core::Store::open(&config.db_path.to_string_lossy()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {}: {e}", e.kind_name());
            return ExitCode::from(1);
        }
    };
    let scheduler = Scheduler::new(store);

    match cli.command {
        Command::Submit {
            command,
            name,
            working_dir,
            cpus,
            memory,
            timeout_seconds,
            priority,
            output,
            error,
        } => {
            let req = SubmitRequest {
                command,
                job_name: name,
                working_dir,
                cpus,
                memory,
                timeout_seconds,
                priority: Some(priority),
                output_path: output,
                error_path: error,
            };
            emit(cli.json, scheduler.submit_job(req).await)
        }
        Command::Status { job_id } => emit(
            cli.json,
            scheduler
                .get_job_status(&job_id)
                .await
                .and_then(|j| j.ok_or_else(|| schedarray_core::SchedError::NotFound(job_id))),
        ),
        Command::List { state, user, limit } => {
            let filter_state = match state.map(|s| JobState::parse(&s)).transpose() {
                Ok(s) => s,
                Err(e) => return print_error(&e),
            };
            let filter = JobFilter {
                state: filter_state,
                user,
                limit,
            };
            emit(cli.json, scheduler.list_jobs(filter).await)
        }
        Command::Cancel { job_id } => emit(cli.json, scheduler.cancel_job(&job_id).await),
        Command::Delete { job_id } => emit(cli.json, scheduler.delete_job(&job_id).await),
        Command::Cleanup {
            states,
            older_than_days,
        } => {
            let parsed = match states.iter().map(|s| JobState::parse(s)).collect::<Result<Vec<_>, _>>() {
                Ok(s) => s,
                Err(e) => return print_error(&e),
            };
            emit(cli.json, scheduler.cleanup(&parsed, older_than_days).await)
        }
        Command::Counts => emit(cli.json, scheduler.count_by_state().await),
        Command::Service { action } => run_service(action, config, scheduler, cli.json).await,
    }
}

async fn run_service(action: ServiceAction, config: Config, scheduler: Scheduler, json: bool) -> ExitCode {
    let pool = schedarray_core::WorkerPool::new(
        scheduler.clone(),
        schedarray_core::WorkerPoolConfig {
            max_workers: config.max_workers,
            poll_interval: std::time::Duration::from_secs(config.poll_interval_secs),
            log_dir: config.log_dir.clone(),
        },
    );
    let mut service_config = ServiceConfig::new(config.pid_path());
    service_config.drain_timeout = std::time::Duration::from_secs(config.drain_timeout_secs);
    let pid_path = service_config.pid_path.clone();
    let service = Service::new(service_config, scheduler, pool);

    match action {
        ServiceAction::Start => {
            if let Err(e) = service.start().await {
                return print_error(&e);
            }
            match service.run_until_shutdown().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => print_error(&e),
            }
        }
        // `service start` runs in its own process and blocks until a signal
        // arrives; `stop` here is a distinct, short-lived invocation, so it
        // signals that process by pid rather than operating on the pool
        // object just constructed above (which was never started).
        ServiceAction::Stop => match signal_running_service(&pid_path) {
            Ok(()) => emit(json, Ok::<_, schedarray_core::SchedError>("stop signal sent")),
            Err(e) => print_error(&e),
        },
        ServiceAction::Status => emit(json, service.status().await),
    }
}

fn emit<T: Serialize>(json: bool, result: schedarray_core::Result<T>) -> ExitCode
where
    T: std::fmt::Debug,
{
    match result {
        Ok(value) => {
            if json {
                let response = Response {
                    success: true,
                    data: Some(value),
                    error: None,
                };
                println!("{}", serde_json::to_string(&response).unwrap());
            } else {
                println!("{value:?}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => print_error(&e),
    }
}

fn print_error(e: &schedarray_core::SchedError) -> ExitCode {
    eprintln!("error: {}: {e}", e.kind_name());
    ExitCode::from(1)
}

/// Reads the pid lock and sends SIGTERM to the process holding it. `service
/// start` itself reacts by draining and exiting; this call does not wait for
/// that to finish.
fn signal_running_service(pid_path: &std::path::Path) -> schedarray_core::Result<()> {
    let contents = std::fs::read_to_string(pid_path).map_err(|_| {
        schedarray_core::SchedError::NotFound("no running service (no pid lock found)".to_string())
    })?;
    let pid: i32 = contents.trim().parse().map_err(|_| {
        schedarray_core::SchedError::Validation("pid lock file is corrupt".to_string())
    })?;

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(schedarray_core::SchedError::Validation(format!(
                    "failed to signal pid {pid}: {err}"
                )));
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }

    Ok(())
}
