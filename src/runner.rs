use crate::executor::CommandRunner;
use crate::lease::{DEFAULT_LEASE_DURATION, Leaser};
use crate::policy::{Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
use crate::reaper::{DEFAULT_REAP_INTERVAL, Reaper};
use crate::worker::Worker;
use futures_util::future::join_all;
use rand::Rng;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for leasing and running jobs
pub struct Runner<R: CommandRunner, State = Unconfigured> {
    connection_pool: PgPool,
    queues: BTreeMap<String, WorkerConfig>,
    command_runner: Arc<R>,
    shutdown_when_queue_empty: bool,
    worker_prefix: String,
    reap_interval: Option<Duration>,
    _state: PhantomData<State>,
}

impl<R: CommandRunner + std::fmt::Debug, State: std::fmt::Debug> std::fmt::Debug
    for Runner<R, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues)
            .field("command_runner", &self.command_runner)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .field("worker_prefix", &self.worker_prefix)
            .finish()
    }
}

impl<R: CommandRunner> Runner<R> {
    /// Create a new runner executing commands with `command_runner`.
    pub fn new(connection_pool: PgPool, command_runner: R) -> Self {
        Self {
            connection_pool,
            queues: BTreeMap::new(),
            command_runner: Arc::new(command_runner),
            shutdown_when_queue_empty: false,
            worker_prefix: default_worker_prefix(),
            reap_interval: Some(DEFAULT_REAP_INTERVAL),
            _state: PhantomData,
        }
    }
}

impl<R: CommandRunner, State> Runner<R, State> {
    /// Configure a queue to be worked on by this runner.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(WorkerConfig) -> WorkerConfig,
    ) -> Runner<R, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(WorkerConfig::default()));

        Runner {
            connection_pool: self.connection_pool,
            queues: self.queues,
            command_runner: self.command_runner,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            worker_prefix: self.worker_prefix,
            reap_interval: self.reap_interval,
            _state: PhantomData,
        }
    }

    /// Set the runner to shut down when there are no eligible jobs left.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Set the prefix of worker identities.
    ///
    /// Identities are `{prefix}-{queue}-{slot}` and must be unique across all
    /// processes sharing the database. The default combines the host name, the
    /// process id and a random suffix.
    pub fn worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    /// Set how often expired leases are swept, `None` to only reclaim them
    /// when leasing.
    pub fn reap_interval(mut self, interval: Option<Duration>) -> Self {
        self.reap_interval = interval;
        self
    }
}

impl<R: CommandRunner> Runner<R, Configured> {
    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to wait for the workers to
    /// shut down, or to shut them down.
    pub fn start(&self) -> RunHandle {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();

        let mut handles = Vec::new();
        for (queue_name, config) in &self.queues {
            let leaser = Leaser::new(self.connection_pool.clone(), config.lease_duration);

            for i in 1..=config.concurrency {
                let name = format!("{}-{queue_name}-{i}", self.worker_prefix);
                info!(worker.id = %name, "Starting worker…");

                let worker = Worker {
                    id: name.clone(),
                    queue: queue_name.clone(),
                    leaser: leaser.clone(),
                    command_runner: self.command_runner.clone(),
                    backoff: config.backoff,
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: config.poll_interval,
                    jitter: config.jitter,
                    job_timeout: config.job_timeout,
                    stop: stop.clone(),
                    abort: abort.clone(),
                };

                let span = info_span!("worker", worker.id = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        let reaper = self.reap_interval.map(|interval| {
            let leaser = Leaser::new(self.connection_pool.clone(), DEFAULT_LEASE_DURATION);
            Reaper::new(leaser, interval.max(MIN_INTERVAL)).start(stop.clone())
        });

        RunHandle {
            handles,
            reaper,
            stop,
            abort,
        }
    }
}

fn default_worker_prefix() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "qq".to_string());
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{host}-{}-{suffix:08x}", std::process::id())
}

/// Handle to a running job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl RunHandle {
    /// Wait for all workers to shut down on their own.
    ///
    /// Workers only stop by themselves when the runner was built with
    /// [`Runner::shutdown_when_queue_empty`].
    pub async fn wait_for_shutdown(self) {
        report(join_all(self.handles).await);
        self.stop.cancel();
        stop_reaper(self.reaper).await;
    }

    /// Stop leasing new jobs and wait for running commands.
    ///
    /// Commands still running after `grace` are killed and recorded as failed
    /// attempts. Jobs leased but not started yet are given back to the queue.
    pub async fn shutdown(self, grace: Duration) {
        info!("Shutting down workers…");
        self.stop.cancel();

        let mut workers = std::pin::pin!(join_all(self.handles));
        let results = match tokio::time::timeout(grace, &mut workers).await {
            Ok(results) => results,
            Err(_) => {
                warn!(?grace, "Grace period elapsed, aborting running commands");
                self.abort.cancel();
                workers.await
            }
        };
        report(results);
        stop_reaper(self.reaper).await;
        info!("All workers stopped");
    }
}

fn report(results: Vec<Result<(), tokio::task::JoinError>>) {
    for result in results {
        if let Err(error) = result {
            warn!(%error, "Worker task panicked");
        }
    }
}

async fn stop_reaper(reaper: Option<JoinHandle<()>>) {
    if let Some(reaper) = reaper {
        if let Err(error) = reaper.await {
            warn!(%error, "Reaper task panicked");
        }
    }
}

/// Settings for the workers of one queue.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    concurrency: usize,
    poll_interval: Duration,
    jitter: Duration,
    lease_duration: Duration,
    backoff: Backoff,
    job_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease_duration: DEFAULT_LEASE_DURATION,
            backoff: Backoff::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            job_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// Set the number of jobs of this queue run at the same time.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long a lease lasts without renewal.
    ///
    /// Running jobs renew their lease every third of this duration. A worker
    /// that dies leaves its jobs locked for at most this long.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration.max(MIN_INTERVAL);
        self
    }

    /// Set the retry delay: `base * 2^attempt`, at most `cap`.
    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = Backoff::new(base, cap);
        self
    }

    /// Kill commands running longer than `timeout`.
    pub fn job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }
}
