#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod errors;
/// Running job commands.
pub mod executor;
mod job;
/// Leasing protocol.
pub mod lease;
/// Eligibility, ordering and retry rules.
pub mod policy;
/// Read-only views over jobs and results.
pub mod query;
mod reaper;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

use sqlx::PgPool;

/// Error types.
pub use self::errors::{QueueError, ValidationError};
/// Command execution.
pub use self::executor::{CommandOutput, CommandRunner, ShellRunner};
/// Enqueueing and cancelling jobs.
pub use self::job::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, MIN_PRIORITY, NewJob,
    add_job, cancel_job,
};
/// Leasing.
pub use self::lease::Leaser;
/// Queries.
pub use self::query::{
    JobFilter, JobOutput, JobSummary, QueueStats, get_job, get_job_output, get_queue_stats,
    list_jobs, result_history,
};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured, WorkerConfig};
/// Row types.
pub use self::schema::{Job, JobKind, JobResult, JobState};
/// Maintenance.
pub use self::storage::{ReapedJob, purge_finished_jobs};

/// Create or upgrade the `jobs` and `job_results` tables.
///
/// Safe to call from several processes at once: migrations are serialized
/// through an advisory lock.
pub async fn setup_database(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
