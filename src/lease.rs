//! Leasing protocol.
//!
//! A lease is a time-bounded claim on one job by one worker identity. Leases
//! are taken with `FOR UPDATE SKIP LOCKED` inside a single statement, so
//! concurrent workers, in this process or any other, never lease the same job.
//! A lease that isn't renewed expires and the job goes back to `pending`.

use crate::errors::QueueError;
use crate::schema::{Job, JobState};
use crate::storage::{self, ReapedJob};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default lifetime of a lease that isn't renewed.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Takes, renews and gives back leases on jobs.
#[derive(Debug, Clone)]
pub struct Leaser {
    pool: PgPool,
    lease_duration: Duration,
}

impl Leaser {
    /// Create a leaser handing out leases of `lease_duration`.
    pub fn new(pool: PgPool, lease_duration: Duration) -> Self {
        Self {
            pool,
            lease_duration,
        }
    }

    /// How long a lease lasts without renewal.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|duration| now.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Lease the next eligible job of `queue` for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible; callers should wait before
    /// trying again.
    pub async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<Job>, QueueError> {
        self.acquire_lease_at(queue, worker_id, Utc::now()).await
    }

    /// Like [`Self::acquire_lease`], evaluated at `now`.
    ///
    /// Expired leases of `queue` are reclaimed in the same transaction before
    /// looking for a job.
    pub async fn acquire_lease_at(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let reaped = storage::reap_expired_leases_tx(&mut tx, Some(queue), now).await?;
        let job =
            storage::lease_next_job_tx(&mut tx, queue, worker_id, now, self.deadline(now)).await?;

        tx.commit().await?;

        log_reaped(&reaped);
        match &job {
            Some(job) => debug!(job.id = job.id, worker.id = worker_id, "Leased job"),
            None => trace!(queue, "No eligible job"),
        }
        Ok(job)
    }

    /// Extend the lease `worker_id` holds on `job_id`.
    ///
    /// Fails with [`QueueError::LeaseLost`] when the job was reclaimed,
    /// cancelled or finished in the meantime.
    pub async fn renew_lease(
        &self,
        job_id: i64,
        worker_id: &str,
    ) -> Result<DateTime<Utc>, QueueError> {
        self.renew_lease_at(job_id, worker_id, Utc::now()).await
    }

    /// Like [`Self::renew_lease`], evaluated at `now`.
    pub async fn renew_lease_at(
        &self,
        job_id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError> {
        storage::renew_lease(&self.pool, job_id, worker_id, now, self.deadline(now)).await
    }

    /// Hand a leased job that was never started back to the queue.
    pub async fn release_lease(&self, job_id: i64, worker_id: &str) -> Result<(), QueueError> {
        storage::release_lease(&self.pool, job_id, worker_id, Utc::now()).await
    }

    /// Move a job leased by `worker_id` to `running`, counting a new attempt.
    pub async fn start(&self, job_id: i64, worker_id: &str) -> Result<Job, QueueError> {
        let now = Utc::now();
        storage::mark_running(&self.pool, job_id, worker_id, now, self.deadline(now)).await
    }

    /// Reclaim every expired lease, across all queues.
    pub async fn reap_expired_leases(&self) -> Result<Vec<ReapedJob>, QueueError> {
        self.reap_expired_leases_at(Utc::now()).await
    }

    /// Like [`Self::reap_expired_leases`], evaluated at `now`.
    pub async fn reap_expired_leases_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedJob>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let reaped = storage::reap_expired_leases_tx(&mut tx, None, now).await?;
        tx.commit().await?;

        log_reaped(&reaped);
        Ok(reaped)
    }
}

fn log_reaped(reaped: &[ReapedJob]) {
    for job in reaped {
        if job.state == JobState::Failed {
            warn!(
                job.id = job.id,
                job.attempt = job.attempt,
                worker.id = %job.previous_holder,
                "Lease expired on last attempt, job failed"
            );
        } else {
            warn!(
                job.id = job.id,
                worker.id = %job.previous_holder,
                "Lease expired, job returned to the queue"
            );
        }
    }
}
