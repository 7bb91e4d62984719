use crate::schema::JobState;
use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The request was rejected before anything was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The connection or transaction failed. Nothing was committed, so the
    /// operation can be retried.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// Applying the migrations failed.
    #[error("failed to initialize the job schema: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),

    /// The requested transition is not part of the state machine. The job
    /// was left unchanged.
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        /// The job the transition was requested for
        job_id: i64,
        /// Its state at the time of the request
        from: JobState,
        /// The requested state
        to: JobState,
    },

    /// The worker no longer holds the lease on the job.
    #[error("worker {worker_id} lost its lease on job {job_id}")]
    LeaseLost {
        /// The job whose lease was lost
        job_id: i64,
        /// The worker that used to hold it
        worker_id: String,
    },

    /// No job exists with this id.
    #[error("job {0} not found")]
    JobNotFound(i64),
}

/// Reasons for rejecting a job or a query before touching the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The command is empty or whitespace only.
    #[error("job command must not be empty")]
    EmptyCommand,

    /// The command contains a NUL byte, which can't be stored.
    #[error("job command must not contain NUL bytes")]
    NulInCommand,

    /// Queue names are 1 to 128 characters of `[A-Za-z0-9_.-]`.
    #[error("invalid queue name `{0}`")]
    InvalidQueueName(String),

    /// The priority is outside the accepted range.
    #[error("priority {0} is out of range ({min}..={max})", min = crate::job::MIN_PRIORITY, max = crate::job::MAX_PRIORITY)]
    PriorityOutOfRange(i32),

    /// At least one attempt must be allowed.
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    /// List limits must be positive.
    #[error("limit must be at least 1, got {0}")]
    InvalidLimit(i64),
}
