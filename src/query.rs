//! Read-only views over jobs and their results.
//!
//! Nothing in here writes to the database. Queries run against the live
//! tables without snapshot isolation across calls, so statistics are a
//! best-effort picture of a moving system.

use crate::errors::{QueueError, ValidationError};
use crate::schema::{JOB_COLUMNS, Job, JobResult, JobState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;

/// Default number of jobs returned by [`list_jobs`].
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Filter for [`list_jobs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    /// Only jobs of this queue
    pub queue: Option<String>,
    /// Only jobs in this state
    pub state: Option<JobState>,
    /// At most this many jobs
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            state: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// A job together with the result of its latest attempt.
#[derive(Debug, Clone, FromRow)]
pub struct JobSummary {
    /// The job row
    #[sqlx(flatten)]
    pub job: Job,
    /// Output of the latest attempt, if it recorded one
    pub output: Option<String>,
    /// Exit code of the latest attempt, if it recorded one
    pub exit_code: Option<i32>,
    /// Attempt number the output belongs to
    pub result_attempt: Option<i32>,
}

/// Output of the most recent attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct JobOutput {
    /// The attempt the output belongs to
    pub attempt: i32,
    /// Combined stdout and stderr
    pub output: String,
    /// Exit code of the command
    pub exit_code: i32,
    /// When the output was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct QueueStats {
    /// Waiting, including jobs scheduled in the future and retries
    pub pending: i64,
    /// Claimed but not started
    pub leased: i64,
    /// Executing
    pub running: i64,
    /// Finished successfully
    pub completed: i64,
    /// Out of attempts
    pub failed: i64,
    /// Cancelled before finishing
    pub cancelled: i64,
}

#[derive(FromRow)]
struct QueueStatsRow {
    queue: String,
    #[sqlx(flatten)]
    stats: QueueStats,
}

/// List jobs, newest first, each with its latest result.
pub async fn list_jobs(pool: &PgPool, filter: &JobFilter) -> Result<Vec<JobSummary>, QueueError> {
    if filter.limit < 1 {
        return Err(ValidationError::InvalidLimit(filter.limit).into());
    }

    let columns = JOB_COLUMNS
        .split(", ")
        .map(|column| format!("j.{column}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = QueryBuilder::<Postgres>::new(format!(
        r"
        SELECT {columns},
               r.output, r.exit_code, r.attempt AS result_attempt
        FROM jobs j
        LEFT JOIN LATERAL (
            SELECT output, exit_code, attempt
            FROM job_results
            WHERE job_id = j.id
            ORDER BY attempt DESC
            LIMIT 1
        ) r ON TRUE
        WHERE TRUE
        "
    ));

    if let Some(queue) = &filter.queue {
        query.push(" AND j.queue = ").push_bind(queue);
    }
    if let Some(state) = filter.state {
        query.push(" AND j.state = ").push_bind(state);
    }
    query
        .push(" ORDER BY j.created_at DESC, j.id DESC LIMIT ")
        .push_bind(filter.limit);

    Ok(query.build_query_as::<JobSummary>().fetch_all(pool).await?)
}

/// Load a single job.
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Job, QueueError> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueError::JobNotFound(job_id))
}

/// Output of the most recent attempt of a job, `None` if it never finished
/// an attempt.
///
/// Results outlive purged jobs, so this only fails with `JobNotFound` when
/// there is neither a job nor a result for `job_id`.
pub async fn get_job_output(pool: &PgPool, job_id: i64) -> Result<Option<JobOutput>, QueueError> {
    let output = sqlx::query_as::<_, JobOutput>(
        r"
        SELECT attempt, output, exit_code, recorded_at
        FROM job_results
        WHERE job_id = $1
        ORDER BY attempt DESC
        LIMIT 1
        ",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    if output.is_none() {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(pool)
            .await?;
        if !exists {
            return Err(QueueError::JobNotFound(job_id));
        }
    }

    Ok(output)
}

/// Every recorded attempt of a job, oldest first.
pub async fn result_history(pool: &PgPool, job_id: i64) -> Result<Vec<JobResult>, QueueError> {
    Ok(sqlx::query_as::<_, JobResult>(
        r"
        SELECT job_id, attempt, output, exit_code, recorded_at
        FROM job_results
        WHERE job_id = $1
        ORDER BY attempt ASC
        ",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?)
}

/// Count jobs per state for every queue, or only for `queue`.
pub async fn get_queue_stats(
    pool: &PgPool,
    queue: Option<&str>,
) -> Result<BTreeMap<String, QueueStats>, QueueError> {
    let rows = sqlx::query_as::<_, QueueStatsRow>(
        r"
        SELECT queue,
               COUNT(*) FILTER (WHERE state = 'pending') AS pending,
               COUNT(*) FILTER (WHERE state = 'leased') AS leased,
               COUNT(*) FILTER (WHERE state = 'running') AS running,
               COUNT(*) FILTER (WHERE state = 'completed') AS completed,
               COUNT(*) FILTER (WHERE state = 'failed') AS failed,
               COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled
        FROM jobs
        WHERE $1::TEXT IS NULL OR queue = $1
        GROUP BY queue
        ",
    )
    .bind(queue)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| (row.queue, row.stats)).collect())
}
