//! SchedArray: a single-host shell-command job scheduler with embedded
//! persistent storage, atomic job claiming, and a supervised worker pool.

pub mod config;
pub mod error;
pub mod job;
mod procguard;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Result, SchedError};
pub use job::{Job, JobState, SubmitRequest};
pub use scheduler::Scheduler;
pub use service::{Service, ServiceConfig, ServiceStatus};
pub use store::{JobFilter, Store};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerStatus};
