use crate::errors::QueueError;
use crate::executor::{CommandOutput, CommandRunner};
use crate::lease::Leaser;
use crate::policy::{self, Backoff, RetryDecision};
use crate::schema::{Job, JobKind};
use crate::storage::{self, Finish};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// One execution slot: leases jobs of a single queue and runs them one at a
/// time.
pub(crate) struct Worker<R> {
    pub(crate) id: String,
    pub(crate) queue: String,
    pub(crate) leaser: Leaser,
    pub(crate) command_runner: Arc<R>,
    pub(crate) backoff: Backoff,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) job_timeout: Option<Duration>,
    /// Stop leasing new jobs.
    pub(crate) stop: CancellationToken,
    /// Kill commands that are still running.
    pub(crate) abort: CancellationToken,
}

impl<R: CommandRunner> Worker<R> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    async fn pause(&self) {
        tokio::select! {
            () = sleep(self.sleep_duration_with_jitter()) => {}
            () = self.stop.cancelled() => {}
        }
    }

    /// Run jobs until told to stop, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        while !self.stop.is_cancelled() {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No eligible jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    trace!("No eligible jobs found. Polling again…");
                    self.pause().await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    self.pause().await;
                }
            }
        }
        debug!("Worker stopped");
    }

    /// Lease and run the next job of the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was leased
    /// - `Ok(None)` if no jobs were eligible
    /// - `Err(...)` if talking to the store failed
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        trace!("Looking for next job…");

        let Some(job) = self.leaser.acquire_lease(&self.queue, &self.id).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        let span = info_span!("job", job.id = %job_id, job.queue = %job.queue);
        self.execute(job).instrument(span).await?;

        Ok(Some(job_id))
    }

    async fn execute(&self, job: Job) -> anyhow::Result<()> {
        if self.stop.is_cancelled() {
            debug!("Shutting down, releasing lease…");
            self.leaser.release_lease(job.id, &self.id).await?;
            return Ok(());
        }

        let job = match self.leaser.start(job.id, &self.id).await {
            Ok(job) => job,
            Err(QueueError::LeaseLost { .. }) => {
                warn!("Job was taken away before it started");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        info!(job.attempt = job.attempt, "Running job…");
        let (output, lease_lost) = self.run_command(&job).await;

        let now = Utc::now();
        if let Err(error) = storage::insert_result(
            self.leaser.pool(),
            job.id,
            job.attempt,
            &output.output,
            output.exit_code,
            now,
        )
        .await
        {
            error!("Failed to record job output: {error}");
        }

        if lease_lost {
            warn!("Lease lost while running, result recorded without finalizing");
            return Ok(());
        }

        let finish = if output.success() {
            Finish::Completed
        } else {
            let error = output.failure_reason();
            warn!(exit_code = output.exit_code, "Job attempt failed: {error}");
            match policy::retry_decision(job.attempt, job.max_attempts, now, &self.backoff) {
                RetryDecision::Retry { at } => Finish::Retry { at, error },
                RetryDecision::Discard => Finish::Discard { error },
            }
        };

        match storage::finish_job(self.leaser.pool(), job.id, &self.id, finish, now).await {
            Ok(state) => info!(%state, exit_code = output.exit_code, "Finished job"),
            Err(QueueError::LeaseLost { .. }) => {
                warn!("Lease lost before the job could be finalized");
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    /// Runs the command while keeping the lease alive.
    ///
    /// Returns the output and whether the lease was lost on the way.
    async fn run_command(&self, job: &Job) -> (CommandOutput, bool) {
        let token = self.abort.child_token();
        let command_runner = &*self.command_runner;

        let run = with_sentry_transaction("qq.job", || {
            let token = token.clone();
            async move {
                let future = match job.kind {
                    JobKind::Bash => command_runner.run(&job.command, token),
                };
                AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| CommandOutput::failure(try_to_extract_panic_info(&*panic)))
            }
        });
        let mut run = std::pin::pin!(run);

        let renew_every = (self.leaser.lease_duration() / 3).max(MIN_RENEW_INTERVAL);
        let mut heartbeat = interval_at(Instant::now() + renew_every, renew_every);

        let timeout = async {
            match self.job_timeout {
                Some(timeout) => sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let mut timeout = std::pin::pin!(timeout);

        let mut lease_lost = false;
        let mut timed_out = false;
        let mut output = loop {
            tokio::select! {
                output = &mut run => break output,
                _ = heartbeat.tick(), if !lease_lost => {
                    match self.leaser.renew_lease(job.id, &self.id).await {
                        Ok(expires_at) => trace!(%expires_at, "Renewed lease"),
                        Err(QueueError::LeaseLost { .. }) => {
                            warn!("Lease lost, aborting command");
                            lease_lost = true;
                            token.cancel();
                        }
                        Err(error) => warn!("Failed to renew lease: {error}"),
                    }
                }
                () = &mut timeout, if !timed_out => {
                    warn!("Job timed out, aborting command");
                    timed_out = true;
                    token.cancel();
                }
            }
        };

        if timed_out {
            if let Some(timeout) = self.job_timeout {
                output.error = Some(format!("command timed out after {timeout:?}"));
            }
        }
        (output, lease_lost)
    }
}
