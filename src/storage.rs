use crate::errors::QueueError;
use crate::schema::{AttemptError, JOB_COLUMNS, Job, JobState};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::warn;

/// How a running job ends, as decided by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Finish {
    /// Exit code 0.
    Completed,
    /// Failed with attempts left: back to `pending`, due at `at`.
    Retry { at: DateTime<Utc>, error: String },
    /// Failed for the last time.
    Discard { error: String },
}

/// A job returned to the queue (or failed) because its lease expired.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ReapedJob {
    /// The job id
    pub id: i64,
    /// Queue of the job
    pub queue: String,
    /// State after reaping: `pending`, or `failed` when no attempts are left
    pub state: JobState,
    /// Attempts made so far (unchanged by reaping)
    pub attempt: i32,
    /// The worker whose lease expired
    pub previous_holder: String,
}

/// Locks the job row for the rest of the transaction and returns its state.
pub(crate) async fn lock_job_state(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<JobState, QueueError> {
    sqlx::query_scalar::<_, JobState>("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(QueueError::JobNotFound(job_id))
}

/// Locks the job row for the rest of the transaction and returns it.
pub(crate) async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<Job, QueueError> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(QueueError::JobNotFound(job_id))
}

fn ensure_transition(job_id: i64, from: JobState, to: JobState) -> Result<(), QueueError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        warn!(job.id = job_id, %from, %to, "Rejected invalid state transition");
        Err(QueueError::InvalidStateTransition { job_id, from, to })
    }
}

/// Fails with `LeaseLost` unless `job` is in `state` and leased by `worker_id`.
fn ensure_holder(job: &Job, state: JobState, worker_id: &str) -> Result<(), QueueError> {
    if job.state == state && job.leased_by.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(QueueError::LeaseLost {
            job_id: job.id,
            worker_id: worker_id.to_string(),
        })
    }
}

/// Moves a locked job from `from` to `to`, dropping the lease.
///
/// Only used for transitions that end or give up a lease (`cancel`,
/// `release`); the lease-carrying transitions have their own functions.
pub(crate) async fn transition(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    from: JobState,
    to: JobState,
    now: DateTime<Utc>,
) -> Result<(), QueueError> {
    ensure_transition(job_id, from, to)?;

    sqlx::query(
        r"
        UPDATE jobs
        SET state = $2,
            leased_by = NULL,
            lease_expires_at = NULL,
            updated_at = $3,
            finalized_at = CASE WHEN $4 THEN $3 ELSE finalized_at END
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(to)
    .bind(now)
    .bind(to.is_terminal())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Finds the best eligible job of `queue` and leases it to `worker_id`.
///
/// Rows locked by concurrent callers are skipped, so two transactions never
/// lease the same job.
pub(crate) async fn lease_next_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Job>, QueueError> {
    let job = sqlx::query_as::<_, Job>(&format!(
        r"
        WITH next_job AS (
            SELECT id
            FROM jobs
            WHERE state = 'pending'
              AND queue = $1
              AND scheduled_at <= $2
            ORDER BY priority ASC, scheduled_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs
        SET state = 'leased',
            leased_by = $3,
            lease_expires_at = $4,
            updated_at = $2
        WHERE id = (SELECT id FROM next_job)
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(queue)
    .bind(now)
    .bind(worker_id)
    .bind(lease_expires_at)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(job)
}

/// Returns jobs whose lease expired at or before `now` to `pending`.
///
/// The attempt counter is left alone. A `running` job that already used its
/// last attempt is failed instead, since it was started `max_attempts` times.
pub(crate) async fn reap_expired_leases_tx(
    tx: &mut Transaction<'_, Postgres>,
    queue: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<ReapedJob>, QueueError> {
    let reaped = sqlx::query_as::<_, ReapedJob>(
        r"
        WITH expired AS (
            SELECT id, leased_by AS previous_holder
            FROM jobs
            WHERE state IN ('leased', 'running')
              AND lease_expires_at <= $1
              AND ($2::TEXT IS NULL OR queue = $2)
            FOR UPDATE SKIP LOCKED
        ),
        reaped AS (
            UPDATE jobs
            SET state = CASE
                    WHEN jobs.state = 'running' AND jobs.attempt >= jobs.max_attempts
                    THEN 'failed'::job_state
                    ELSE 'pending'::job_state
                END,
                finalized_at = CASE
                    WHEN jobs.state = 'running' AND jobs.attempt >= jobs.max_attempts
                    THEN $1
                    ELSE NULL
                END,
                leased_by = NULL,
                lease_expires_at = NULL,
                updated_at = $1,
                errors = jobs.errors || jsonb_build_array(jsonb_build_object(
                    'attempt', jobs.attempt,
                    'at', $1::TIMESTAMPTZ,
                    'error', 'lease held by ' || expired.previous_holder || ' expired'
                ))
            FROM expired
            WHERE jobs.id = expired.id
            RETURNING jobs.id, jobs.queue, jobs.state, jobs.attempt, expired.previous_holder
        )
        SELECT id, queue, state, attempt, previous_holder FROM reaped ORDER BY id
        ",
    )
    .bind(now)
    .bind(queue)
    .fetch_all(&mut **tx)
    .await?;

    Ok(reaped)
}

/// Moves a job leased by `worker_id` to `running` and counts the attempt.
pub(crate) async fn mark_running(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Job, QueueError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    ensure_holder(&job, JobState::Leased, worker_id)?;
    ensure_transition(job_id, job.state, JobState::Running)?;

    let job = sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'running',
            attempt = attempt + 1,
            lease_expires_at = $2,
            updated_at = $3
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(job_id)
    .bind(lease_expires_at)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(job)
}

/// Extends the lease held by `worker_id`, returning the new deadline.
pub(crate) async fn renew_lease(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<DateTime<Utc>, QueueError> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r"
        UPDATE jobs
        SET lease_expires_at = $3, updated_at = $4
        WHERE id = $1
          AND leased_by = $2
          AND state IN ('leased', 'running')
        RETURNING lease_expires_at
        ",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(lease_expires_at)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| QueueError::LeaseLost {
        job_id,
        worker_id: worker_id.to_string(),
    })
}

/// Gives a leased, not yet started job back to the queue.
pub(crate) async fn release_lease(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    ensure_holder(&job, JobState::Leased, worker_id)?;
    transition(&mut tx, job_id, job.state, JobState::Pending, now).await?;

    tx.commit().await?;
    Ok(())
}

/// Records the output of one attempt.
///
/// Results are append-only: a second write for the same attempt is ignored.
pub(crate) async fn insert_result(
    pool: &PgPool,
    job_id: i64,
    attempt: i32,
    output: &str,
    exit_code: i32,
    now: DateTime<Utc>,
) -> Result<bool, QueueError> {
    let inserted = sqlx::query(
        r"
        INSERT INTO job_results (job_id, attempt, output, exit_code, recorded_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (job_id, attempt) DO NOTHING
        ",
    )
    .bind(job_id)
    .bind(attempt)
    .bind(output)
    .bind(exit_code)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(inserted == 1)
}

/// Finalizes a running job held by `worker_id`, returning its new state.
pub(crate) async fn finish_job(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    finish: Finish,
    now: DateTime<Utc>,
) -> Result<JobState, QueueError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    ensure_holder(&job, JobState::Running, worker_id)?;

    let (state, scheduled_at, error) = match finish {
        Finish::Completed => (JobState::Completed, job.scheduled_at, None),
        Finish::Retry { at, error } => (JobState::Pending, at, Some(error)),
        Finish::Discard { error } => (JobState::Failed, job.scheduled_at, Some(error)),
    };
    ensure_transition(job_id, job.state, state)?;

    let new_errors: Vec<AttemptError> = error
        .into_iter()
        .map(|error| AttemptError {
            attempt: job.attempt,
            at: now,
            error,
        })
        .collect();

    sqlx::query(
        r"
        UPDATE jobs
        SET state = $2,
            scheduled_at = $3,
            leased_by = NULL,
            lease_expires_at = NULL,
            errors = errors || $4,
            updated_at = $5,
            finalized_at = CASE WHEN $6 THEN $5 ELSE NULL END
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(state)
    .bind(scheduled_at)
    .bind(Json(new_errors))
    .bind(now)
    .bind(state.is_terminal())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(state)
}

/// Deletes terminal jobs finalized before `older_than`. Their results are kept.
pub async fn purge_finished_jobs(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<u64, QueueError> {
    let deleted = sqlx::query(
        r"
        DELETE FROM jobs
        WHERE state IN ('completed', 'failed', 'cancelled')
          AND finalized_at < $1
        ",
    )
    .bind(older_than)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(deleted)
}
