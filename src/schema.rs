//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the `jobs` and `job_results` tables
//! and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::fmt;

/// Lifecycle state of a job.
///
/// `completed`, `failed` and `cancelled` are terminal. A failed attempt that
/// still has retries left goes back to `pending` instead of `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be leased once `scheduled_at` has passed.
    Pending,
    /// Claimed by a worker that has not started the command yet.
    Leased,
    /// The command is executing.
    Running,
    /// The command exited with status 0.
    Completed,
    /// The last allowed attempt failed.
    Failed,
    /// Removed before it could finish.
    Cancelled,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Leased,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Whether no further transition can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Running -> Cancelled` is legal here but only reachable through a
    /// forced cancel.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Pending, Leased)
                | (Pending, Cancelled)
                | (Leased, Running)
                | (Leased, Pending)
                | (Leased, Cancelled)
                | (Running, Completed)
                | (Running, Pending)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// The lowercase name stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state `{s}`"))
    }
}

/// The kind of payload a job carries.
///
/// Workers dispatch on the kind to decide how `command` is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// A command line run through `bash -c`.
    #[default]
    Bash,
}

/// One entry of a job's error history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    /// The attempt the error belongs to.
    pub attempt: i32,
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Human readable description.
    pub error: String,
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Payload kind, selects how `command` is executed
    pub kind: JobKind,
    /// The command line to execute
    pub command: String,
    /// Queue the job belongs to
    pub queue: String,
    /// Priority of the job (lower = more urgent)
    pub priority: i16,
    /// The job is not eligible before this instant
    pub scheduled_at: DateTime<Utc>,
    /// Current lifecycle state
    pub state: JobState,
    /// Number of execution attempts started so far
    pub attempt: i32,
    /// Retry ceiling
    pub max_attempts: i32,
    /// Identity of the worker holding the lease, if any
    pub leased_by: Option<String>,
    /// When the current lease runs out unless renewed
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// One entry per failed attempt or abandoned lease
    pub errors: Json<Vec<AttemptError>>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change
    pub updated_at: DateTime<Utc>,
    /// Timestamp when the job reached a terminal state
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether a worker holds a lease that has not expired at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.leased_by.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }
}

/// The columns selected whenever a full [`Job`] is loaded.
pub(crate) const JOB_COLUMNS: &str = "id, kind, command, queue, priority, scheduled_at, state, \
    attempt, max_attempts, leased_by, lease_expires_at, errors, created_at, updated_at, finalized_at";

/// Captured output of one attempt
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct JobResult {
    /// The job this result belongs to
    pub job_id: i64,
    /// The attempt number, starting at 1
    pub attempt: i32,
    /// Combined stdout and stderr
    pub output: String,
    /// Exit code of the command, -1 when it was killed or never spawned
    pub exit_code: i32,
    /// Timestamp when the result was written
    pub recorded_at: DateTime<Utc>,
}
