//! Process configuration, loaded from environment variables with an optional
//! `.env` file, mirroring this codebase's `Config::from_env()` convention.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;

const DEFAULT_DB_PATH: &str = "schedarray.db";
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Runtime configuration for the CLI and the service. Precedence is CLI flag
/// > environment variable > default, enforced by constructing this from
/// `from_env()` and then letting callers overwrite individual fields with
/// any flag they were given.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub max_workers: usize,
    pub poll_interval_secs: u64,
    pub drain_timeout_secs: u64,
    pub log_dir: PathBuf,
}

impl Config {
    /// Loads configuration from the environment, reading a `.env` file in the
    /// current directory if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let db_path = env::var("SCHEDARRAY_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        let max_workers = env::var("SCHEDARRAY_MAX_WORKERS")
            .ok()
            .map(|v| v.parse().context("SCHEDARRAY_MAX_WORKERS must be a valid number"))
            .transpose()?
            .unwrap_or(DEFAULT_MAX_WORKERS);

        let poll_interval_secs = env::var("SCHEDARRAY_POLL_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse().context("SCHEDARRAY_POLL_INTERVAL_SECS must be a valid number"))
            .transpose()?
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let drain_timeout_secs = env::var("SCHEDARRAY_DRAIN_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse().context("SCHEDARRAY_DRAIN_TIMEOUT_SECS must be a valid number"))
            .transpose()?
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS);

        let log_dir = env::var("SCHEDARRAY_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_log_dir(&db_path));

        Ok(Self {
            db_path,
            max_workers,
            poll_interval_secs,
            drain_timeout_secs,
            log_dir,
        })
    }

    /// The pid lock file lives beside the database file.
    pub fn pid_path(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("schedarray.pid")
    }
}

fn default_log_dir(db_path: &std::path::Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("logs")
}
