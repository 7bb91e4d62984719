use crate::errors::{QueueError, ValidationError};
use crate::schema::{JobKind, JobState};
use crate::storage;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";
/// Priority given to jobs that don't ask for one.
pub const DEFAULT_PRIORITY: i16 = 1;
/// Smallest accepted priority (most urgent).
pub const MIN_PRIORITY: i16 = 0;
/// Largest accepted priority (least urgent).
pub const MAX_PRIORITY: i16 = 1000;
/// Number of attempts allowed when the job doesn't say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

const MAX_QUEUE_NAME_LEN: usize = 128;

/// A job waiting to be enqueued.
///
/// ```no_run
/// # async fn example(pool: sqlx::PgPool) -> Result<(), qq::QueueError> {
/// let _id = qq::NewJob::new("echo hello")
///     .queue("reports")
///     .priority(0)
///     .enqueue(&pool)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    kind: JobKind,
    command: String,
    queue: String,
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
    max_attempts: i32,
}

impl NewJob {
    /// A bash job running `command` on the default queue.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Bash,
            command: command.into(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY.into(),
            scheduled_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Put the job on another queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the priority. Lower values run first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Don't run the job before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Set how many attempts the job gets before it is marked failed.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check the job without touching the database.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }
        if self.command.contains('\0') {
            return Err(ValidationError::NulInCommand);
        }
        validate_queue_name(&self.queue)?;
        if !(i32::from(MIN_PRIORITY)..=i32::from(MAX_PRIORITY)).contains(&self.priority) {
            return Err(ValidationError::PriorityOutOfRange(self.priority));
        }
        if self.max_attempts < 1 {
            return Err(ValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        Ok(())
    }

    /// Enqueue this job for background execution, returning its id.
    #[instrument(name = "qq.enqueue", skip(self, pool), fields(queue = %self.queue))]
    pub async fn enqueue(&self, pool: &PgPool) -> Result<i64, QueueError> {
        self.enqueue_at(pool, Utc::now()).await
    }

    /// Like [`Self::enqueue`], with `now` as the creation time.
    pub async fn enqueue_at(&self, pool: &PgPool, now: DateTime<Utc>) -> Result<i64, QueueError> {
        self.validate()?;

        // Validated to fit above.
        let priority = i16::try_from(self.priority)
            .map_err(|_| ValidationError::PriorityOutOfRange(self.priority))?;
        let scheduled_at = self.scheduled_at.unwrap_or(now);

        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (kind, command, queue, priority, scheduled_at, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id
            ",
        )
        .bind(self.kind)
        .bind(&self.command)
        .bind(&self.queue)
        .bind(priority)
        .bind(scheduled_at)
        .bind(self.max_attempts)
        .bind(now)
        .fetch_one(pool)
        .await?;

        info!(job.id = id, %scheduled_at, "Enqueued job");
        Ok(id)
    }
}

/// Enqueue `command` on `queue` with the given priority and optional schedule.
///
/// Shorthand for building a [`NewJob`].
pub async fn add_job(
    pool: &PgPool,
    command: &str,
    queue: &str,
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<i64, QueueError> {
    let mut job = NewJob::new(command).queue(queue).priority(priority);
    if let Some(at) = scheduled_at {
        job = job.scheduled_at(at);
    }
    job.enqueue(pool).await
}

/// Cancel a job that hasn't finished.
///
/// `pending` and `leased` jobs are cancelled directly. A `running` job is only
/// cancelled when `force` is set; its worker notices on the next lease renewal
/// and kills the command.
#[instrument(name = "qq.cancel", skip(pool))]
pub async fn cancel_job(pool: &PgPool, job_id: i64, force: bool) -> Result<JobState, QueueError> {
    let mut tx = pool.begin().await?;

    let current = storage::lock_job_state(&mut tx, job_id).await?;
    if current == JobState::Running && !force {
        return Err(QueueError::InvalidStateTransition {
            job_id,
            from: current,
            to: JobState::Cancelled,
        });
    }
    storage::transition(&mut tx, job_id, current, JobState::Cancelled, Utc::now()).await?;
    tx.commit().await?;

    info!(job.id = job_id, from = %current, "Cancelled job");
    Ok(current)
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<(), ValidationError> {
    let valid = !queue.is_empty()
        && queue.len() <= MAX_QUEUE_NAME_LEN
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidQueueName(queue.to_string()))
    }
}
