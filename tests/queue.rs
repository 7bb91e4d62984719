#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, SubsecRound, Utc};
use claims::{assert_matches, assert_none, assert_ok, assert_some, assert_some_eq};
use insta::assert_compact_json_snapshot;
use qq::lease::Leaser;
use qq::{
    JobFilter, JobState, NewJob, QueueError, Runner, ShellRunner, ValidationError, WorkerConfig,
    cancel_job, get_job, get_job_output, get_queue_stats, list_jobs, purge_finished_jobs,
    result_history, setup_database,
};
use sqlx::PgPool;
use sqlx::postgres::PgConnectOptions;
use std::collections::BTreeSet;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Connect to `DATABASE_URL` if it is set, otherwise start a PostgreSQL
    /// container. The container is stopped when the returned handle drops.
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, Option<ContainerAsync<Postgres>>)>
    {
        match std::env::var("DATABASE_URL") {
            Ok(url) => Ok((connect(&url).await?, None)),
            Err(_) => {
                let (pool, container) = start_container().await?;
                Ok((pool, Some(container)))
            }
        }
    }

    /// A database no other test uses, for tests touching rows of every queue.
    ///
    /// With `DATABASE_URL` set this creates a fresh database on that server,
    /// otherwise it starts a container.
    pub(super) async fn setup_isolated_db()
    -> anyhow::Result<(PgPool, Option<ContainerAsync<Postgres>>)> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            let (pool, container) = start_container().await?;
            return Ok((pool, Some(container)));
        };

        let name = format!("qq_test_{:08x}", rand::random::<u32>());
        let admin = PgPool::connect(&url).await?;
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&admin)
            .await?;
        admin.close().await;

        let options = url.parse::<PgConnectOptions>()?.database(&name);
        let pool = PgPool::connect_with(options).await?;
        setup_database(&pool).await?;
        Ok((pool, None))
    }

    async fn start_container() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok((connect(&connection_string).await?, container))
    }

    async fn connect(url: &str) -> anyhow::Result<PgPool> {
        let pool = PgPool::connect(url).await?;
        setup_database(&pool).await?;
        Ok(pool)
    }

    /// A queue name no other test uses, so tests can share a database.
    pub(super) fn unique_queue(name: &str) -> String {
        format!("{name}-{:08x}", rand::random::<u32>())
    }

    /// Runner over a single queue that stops once the queue is drained.
    pub(super) fn create_test_runner(
        pool: PgPool,
        queue: &str,
        config_fn: impl FnOnce(WorkerConfig) -> WorkerConfig,
    ) -> Runner<ShellRunner, qq::Configured> {
        Runner::new(pool, ShellRunner::default())
            .configure_queue(queue, |config| {
                config_fn(config.poll_interval(Duration::from_millis(50)).jitter(Duration::ZERO))
            })
            .worker_prefix("test")
            .reap_interval(None)
            .shutdown_when_queue_empty()
    }

    /// Poll `get_job` until `predicate` holds or ten seconds passed.
    pub(super) async fn wait_for_job(
        pool: &PgPool,
        job_id: i64,
        predicate: impl Fn(&qq::Job) -> bool,
    ) -> anyhow::Result<qq::Job> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = get_job(pool, job_id).await?;
            if predicate(&job) {
                return Ok(job);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} is stuck in {}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub(super) fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

use test_utils::{create_test_runner, now, setup_test_db, unique_queue, wait_for_job};

fn seconds(seconds: i64) -> chrono::Duration {
    chrono::Duration::seconds(seconds)
}

#[tokio::test]
async fn setup_database_is_idempotent() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;

    assert_ok!(setup_database(&pool).await);

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name IN ('jobs', 'job_results')
         AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(table_count, 2, "Expected jobs and job_results tables");

    Ok(())
}

#[tokio::test]
async fn enqueued_command_runs_to_completion() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("echo");

    let job_id = NewJob::new("echo hello").queue(&queue).enqueue(&pool).await?;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt, 0);
    assert_none!(get_job_output(&pool, job_id).await?);

    create_test_runner(pool.clone(), &queue, |c| c)
        .start()
        .wait_for_shutdown()
        .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 1);
    assert_none!(job.leased_by);
    assert_none!(job.lease_expires_at);
    assert_some!(job.finalized_at);
    assert!(job.errors.0.is_empty());

    let output = assert_some!(get_job_output(&pool, job_id).await?);
    assert_eq!(output.output, "hello\n");
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.attempt, 1);

    Ok(())
}

#[tokio::test]
async fn failing_command_is_retried_until_attempts_run_out() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("retry");

    let job_id = NewJob::new("echo attempt; exit 1")
        .queue(&queue)
        .max_attempts(2)
        .enqueue(&pool)
        .await?;

    create_test_runner(pool.clone(), &queue, |c| {
        c.backoff(Duration::ZERO, Duration::ZERO)
    })
    .start()
    .wait_for_shutdown()
    .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 2);
    assert_some!(job.finalized_at);

    let errors = job.errors.0.iter().map(|e| (e.attempt, e.error.as_str())).collect::<Vec<_>>();
    assert_compact_json_snapshot!(errors, @r#"[[1, "command exited with code 1"], [2, "command exited with code 1"]]"#);

    let history = result_history(&pool, job_id).await?;
    let history = history.iter().map(|r| (r.attempt, r.exit_code)).collect::<Vec<_>>();
    assert_eq!(history, vec![(1, 1), (2, 1)]);

    let output = assert_some!(get_job_output(&pool, job_id).await?);
    assert_eq!(output.attempt, 2);

    Ok(())
}

#[tokio::test]
async fn failed_attempt_is_rescheduled_with_backoff() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("backoff");

    let job_id = NewJob::new("exit 3").queue(&queue).enqueue(&pool).await?;

    let before = Utc::now();
    create_test_runner(pool.clone(), &queue, |c| {
        c.backoff(Duration::from_secs(60), Duration::from_secs(3600))
    })
    .start()
    .wait_for_shutdown()
    .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt, 1);
    assert_none!(job.leased_by);
    assert_none!(job.finalized_at);
    // First retry waits `base * 2^1`.
    assert!(job.scheduled_at >= before + seconds(120));
    assert!(job.scheduled_at <= Utc::now() + seconds(120));

    Ok(())
}

#[tokio::test]
async fn jobs_are_leased_in_priority_order() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("priority");
    let now = now();

    let low = NewJob::new("true").queue(&queue).priority(5).enqueue_at(&pool, now).await?;
    let later = NewJob::new("true")
        .queue(&queue)
        .priority(0)
        .scheduled_at(now - seconds(10))
        .enqueue_at(&pool, now)
        .await?;
    let earlier = NewJob::new("true")
        .queue(&queue)
        .priority(0)
        .scheduled_at(now - seconds(20))
        .enqueue_at(&pool, now)
        .await?;
    let tie = NewJob::new("true")
        .queue(&queue)
        .priority(0)
        .scheduled_at(now - seconds(20))
        .enqueue_at(&pool, now)
        .await?;

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    let mut order = Vec::new();
    while let Some(job) = leaser.acquire_lease_at(&queue, "worker", now).await? {
        assert_eq!(job.state, JobState::Leased);
        assert_some_eq!(job.leased_by.as_deref(), "worker");
        order.push(job.id);
    }

    assert_eq!(order, vec![earlier, tie, later, low]);

    Ok(())
}

#[tokio::test]
async fn scheduled_jobs_wait_for_their_time() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("scheduled");
    let now = now();

    let job_id = NewJob::new("true")
        .queue(&queue)
        .scheduled_at(now + seconds(3600))
        .enqueue_at(&pool, now)
        .await?;

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    assert_none!(leaser.acquire_lease_at(&queue, "worker", now).await?);
    assert_none!(
        leaser
            .acquire_lease_at(&queue, "worker", now + seconds(3599))
            .await?
    );

    let job = assert_some!(
        leaser
            .acquire_lease_at(&queue, "worker", now + seconds(3600))
            .await?
    );
    assert_eq!(job.id, job_id);

    Ok(())
}

#[tokio::test]
async fn expired_lease_is_taken_over_by_another_worker() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("expiry");
    let now = now();

    let job_id = NewJob::new("true").queue(&queue).enqueue_at(&pool, now).await?;

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    let job = assert_some!(leaser.acquire_lease_at(&queue, "w1", now).await?);
    assert_eq!(job.id, job_id);
    assert_some_eq!(job.lease_expires_at, now + seconds(30));

    // Still held by w1.
    assert_none!(leaser.acquire_lease_at(&queue, "w2", now + seconds(29)).await?);

    let renewed = leaser.renew_lease_at(job_id, "w1", now + seconds(20)).await?;
    assert_eq!(renewed, now + seconds(50));
    assert_none!(leaser.acquire_lease_at(&queue, "w2", now + seconds(49)).await?);

    let job = assert_some!(leaser.acquire_lease_at(&queue, "w2", now + seconds(50)).await?);
    assert_eq!(job.id, job_id);
    assert_some_eq!(job.leased_by.as_deref(), "w2");
    assert_eq!(job.attempt, 0);
    assert_eq!(job.errors.0.len(), 1);
    assert!(job.errors.0[0].error.contains("w1"));

    let error = leaser.renew_lease_at(job_id, "w1", now + seconds(51)).await;
    assert_matches!(error, Err(QueueError::LeaseLost { job_id: id, .. }) if id == job_id);

    Ok(())
}

#[tokio::test]
async fn running_job_on_last_attempt_fails_when_its_lease_expires() -> anyhow::Result<()> {
    // Reaping an hour ahead touches every queue.
    let (pool, _container) = test_utils::setup_isolated_db().await?;
    let queue = unique_queue("reap");

    let job_id = NewJob::new("sleep 60")
        .queue(&queue)
        .max_attempts(1)
        .enqueue(&pool)
        .await?;

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    assert_some!(leaser.acquire_lease(&queue, "crashed").await?);
    let job = leaser.start(job_id, "crashed").await?;
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempt, 1);

    assert!(leaser.reap_expired_leases().await?.iter().all(|r| r.id != job_id));

    let reaped = leaser
        .reap_expired_leases_at(Utc::now() + seconds(3600))
        .await?;
    let reaped = reaped.into_iter().find(|r| r.id == job_id);
    let reaped = assert_some!(reaped);
    assert_eq!(reaped.state, JobState::Failed);
    assert_eq!(reaped.previous_holder, "crashed");

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_none!(job.leased_by);
    assert_some!(job.finalized_at);

    Ok(())
}

#[tokio::test]
async fn concurrent_workers_never_lease_the_same_job() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("concurrent");

    let mut enqueued = BTreeSet::new();
    for i in 0..40 {
        enqueued.insert(NewJob::new(format!("echo {i}")).queue(&queue).enqueue(&pool).await?);
    }

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    let tasks = (0..8).map(|n| {
        let leaser = leaser.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let worker = format!("worker-{n}");
            let mut leased = Vec::new();
            while let Some(job) = leaser.acquire_lease(&queue, &worker).await? {
                leased.push(job.id);
            }
            Ok::<_, QueueError>(leased)
        })
    });

    let mut leased = Vec::new();
    for result in futures_util::future::join_all(tasks).await {
        leased.extend(result??);
    }

    let unique = leased.iter().copied().collect::<BTreeSet<_>>();
    assert_eq!(unique.len(), leased.len(), "a job was leased twice");
    assert_eq!(unique, enqueued);

    Ok(())
}

#[tokio::test]
async fn queue_stats_count_jobs_per_state() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("stats");
    let other = unique_queue("stats-other");

    let cancelled = NewJob::new("true").queue(&queue).enqueue(&pool).await?;
    cancel_job(&pool, cancelled, false).await?;
    for _ in 0..3 {
        NewJob::new("true").queue(&queue).enqueue(&pool).await?;
    }
    NewJob::new("true").queue(&other).enqueue(&pool).await?;

    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    let leased = assert_some!(leaser.acquire_lease(&queue, "w").await?);
    let running = assert_some!(leaser.acquire_lease(&queue, "w").await?);
    leaser.start(running.id, "w").await?;
    assert_eq!(leased.state, JobState::Leased);

    let stats = get_queue_stats(&pool, Some(&queue)).await?;
    assert_eq!(stats.len(), 1);
    let snapshot = assert_some!(stats.get(&queue));
    assert_compact_json_snapshot!(snapshot, @r#"{"pending": 1, "leased": 1, "running": 1, "completed": 0, "failed": 0, "cancelled": 1}"#);

    assert_eq!(get_queue_stats(&pool, Some(&queue)).await?, stats);

    let all = get_queue_stats(&pool, None).await?;
    assert_some_eq!(all.get(&queue), snapshot);
    assert_eq!(assert_some!(all.get(&other)).pending, 1);

    assert!(get_queue_stats(&pool, Some("no-such-queue")).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn cancel_follows_the_state_machine() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("cancel");

    let pending = NewJob::new("true").queue(&queue).enqueue(&pool).await?;
    assert_eq!(cancel_job(&pool, pending, false).await?, JobState::Pending);

    let job = get_job(&pool, pending).await?;
    assert_eq!(job.state, JobState::Cancelled);
    assert_some!(job.finalized_at);

    let error = cancel_job(&pool, pending, false).await;
    assert_matches!(
        error,
        Err(QueueError::InvalidStateTransition { from: JobState::Cancelled, to: JobState::Cancelled, .. })
    );

    let running = NewJob::new("sleep 60").queue(&queue).enqueue(&pool).await?;
    let leaser = Leaser::new(pool.clone(), Duration::from_secs(30));
    assert_some!(leaser.acquire_lease(&queue, "w").await?);
    leaser.start(running, "w").await?;

    let error = cancel_job(&pool, running, false).await;
    assert_matches!(
        error,
        Err(QueueError::InvalidStateTransition { from: JobState::Running, .. })
    );
    assert_eq!(get_job(&pool, running).await?.state, JobState::Running);

    assert_eq!(cancel_job(&pool, running, true).await?, JobState::Running);
    let job = get_job(&pool, running).await?;
    assert_eq!(job.state, JobState::Cancelled);
    assert_none!(job.leased_by);

    let error = leaser.renew_lease(running, "w").await;
    assert_matches!(error, Err(QueueError::LeaseLost { .. }));

    assert_matches!(
        cancel_job(&pool, i64::MAX, false).await,
        Err(QueueError::JobNotFound(i64::MAX))
    );

    Ok(())
}

#[tokio::test]
async fn forced_cancel_kills_the_running_command() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("kill");

    let job_id = NewJob::new("echo started; sleep 30")
        .queue(&queue)
        .enqueue(&pool)
        .await?;

    let runner = Runner::new(pool.clone(), ShellRunner::default())
        .configure_queue(&queue, |c| {
            c.lease_duration(Duration::from_millis(300))
                .poll_interval(Duration::from_millis(50))
        })
        .reap_interval(None);
    let handle = runner.start();

    wait_for_job(&pool, job_id, |job| job.state == JobState::Running).await?;
    cancel_job(&pool, job_id, true).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let result = loop {
        if let Some(result) = result_history(&pool, job_id).await?.pop() {
            break result;
        }
        assert!(tokio::time::Instant::now() < deadline, "command was not killed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    handle.shutdown(Duration::from_secs(5)).await;

    assert_eq!(result.attempt, 1);
    assert_eq!(result.exit_code, qq::executor::NO_EXIT_CODE);
    assert!(result.output.starts_with("started"));

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Cancelled);

    Ok(())
}

#[tokio::test]
async fn running_jobs_keep_their_lease_past_its_duration() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("heartbeat");

    let job_id = NewJob::new("sleep 1.5; echo done")
        .queue(&queue)
        .enqueue(&pool)
        .await?;

    Runner::new(pool.clone(), ShellRunner::default())
        .configure_queue(&queue, |c| {
            c.lease_duration(Duration::from_millis(300))
                .poll_interval(Duration::from_millis(50))
        })
        .reap_interval(Some(Duration::from_millis(30)))
        .shutdown_when_queue_empty()
        .start()
        .wait_for_shutdown()
        .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 1);
    assert!(job.errors.0.is_empty(), "lease was reclaimed: {:?}", job.errors.0);

    let history = result_history(&pool, job_id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].output, "done\n");

    Ok(())
}

#[tokio::test]
async fn nul_bytes_in_output_are_recorded() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("binary");

    let job_id = NewJob::new(r"printf 'a\0b'").queue(&queue).enqueue(&pool).await?;

    create_test_runner(pool.clone(), &queue, |c| c)
        .start()
        .wait_for_shutdown()
        .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 1);

    let history = result_history(&pool, job_id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].output, "a\u{FFFD}b");
    assert_eq!(history[0].exit_code, 0);

    Ok(())
}

#[tokio::test]
async fn commands_exceeding_the_timeout_are_killed() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("timeout");

    let job_id = NewJob::new("sleep 30")
        .queue(&queue)
        .max_attempts(1)
        .enqueue(&pool)
        .await?;

    create_test_runner(pool.clone(), &queue, |c| {
        c.job_timeout(Some(Duration::from_millis(200)))
    })
    .start()
    .wait_for_shutdown()
    .await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.errors.0.len(), 1);
    assert!(job.errors.0[0].error.contains("timed out"));

    let output = assert_some!(get_job_output(&pool, job_id).await?);
    assert_eq!(output.exit_code, qq::executor::NO_EXIT_CODE);

    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_running_commands() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("graceful");

    let job_id = NewJob::new("sleep 0.3; echo done")
        .queue(&queue)
        .enqueue(&pool)
        .await?;

    let handle = Runner::new(pool.clone(), ShellRunner::default())
        .configure_queue(&queue, |c| c.poll_interval(Duration::from_millis(50)))
        .reap_interval(Some(Duration::from_millis(100)))
        .start();

    wait_for_job(&pool, job_id, |job| job.state == JobState::Running).await?;
    handle.shutdown(Duration::from_secs(10)).await;

    let job = get_job(&pool, job_id).await?;
    assert_eq!(job.state, JobState::Completed);
    let output = assert_some!(get_job_output(&pool, job_id).await?);
    assert_eq!(output.output, "done\n");

    Ok(())
}

#[tokio::test]
async fn invalid_jobs_are_rejected() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;

    let cases = [
        (NewJob::new("   "), ValidationError::EmptyCommand),
        (NewJob::new("echo \0"), ValidationError::NulInCommand),
        (
            NewJob::new("true").queue("no spaces"),
            ValidationError::InvalidQueueName("no spaces".into()),
        ),
        (NewJob::new("true").priority(1001), ValidationError::PriorityOutOfRange(1001)),
        (NewJob::new("true").priority(-1), ValidationError::PriorityOutOfRange(-1)),
        (NewJob::new("true").max_attempts(0), ValidationError::InvalidMaxAttempts(0)),
    ];

    for (job, expected) in cases {
        let error = job.enqueue(&pool).await;
        assert_matches!(error, Err(QueueError::Validation(error)) if error == expected);
    }

    let filter = JobFilter {
        limit: 0,
        ..JobFilter::default()
    };
    assert_matches!(
        list_jobs(&pool, &filter).await,
        Err(QueueError::Validation(ValidationError::InvalidLimit(0)))
    );

    assert_matches!(get_job(&pool, i64::MAX).await, Err(QueueError::JobNotFound(_)));
    assert_matches!(get_job_output(&pool, i64::MAX).await, Err(QueueError::JobNotFound(_)));

    Ok(())
}

#[tokio::test]
async fn list_jobs_filters_and_orders_newest_first() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let queue = unique_queue("list");

    let first = qq::add_job(&pool, "echo one", &queue, 1, None).await?;
    let second = qq::add_job(&pool, "echo two", &queue, 1, None).await?;
    let third = qq::add_job(&pool, "echo three", &queue, 1, None).await?;
    cancel_job(&pool, second, false).await?;

    let by_queue = JobFilter {
        queue: Some(queue.clone()),
        ..JobFilter::default()
    };
    let jobs = list_jobs(&pool, &by_queue).await?;
    let ids = jobs.iter().map(|s| s.job.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![third, second, first]);
    assert!(jobs.iter().all(|s| s.output.is_none() && s.exit_code.is_none()));

    let pending = JobFilter {
        state: Some(JobState::Pending),
        ..by_queue.clone()
    };
    let ids = list_jobs(&pool, &pending)
        .await?
        .iter()
        .map(|s| s.job.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![third, first]);

    let limited = JobFilter {
        limit: 1,
        ..by_queue.clone()
    };
    assert_eq!(list_jobs(&pool, &limited).await?.len(), 1);

    create_test_runner(pool.clone(), &queue, |c| c)
        .start()
        .wait_for_shutdown()
        .await;

    let jobs = list_jobs(&pool, &by_queue).await?;
    let first = assert_some!(jobs.iter().find(|s| s.job.id == first));
    assert_some_eq!(first.output.as_deref(), "one\n");
    assert_some_eq!(first.exit_code, 0);
    assert_some_eq!(first.result_attempt, 1);

    Ok(())
}

#[tokio::test]
async fn purging_keeps_results_and_unfinished_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_isolated_db().await?;
    let queue = unique_queue("purge");

    let done = NewJob::new("echo kept").queue(&queue).enqueue(&pool).await?;
    create_test_runner(pool.clone(), &queue, |c| c)
        .start()
        .wait_for_shutdown()
        .await;
    let waiting = NewJob::new("true").queue(&queue).enqueue(&pool).await?;

    assert_eq!(purge_finished_jobs(&pool, Utc::now() - seconds(3600)).await?, 0);
    assert_ok!(get_job(&pool, done).await);

    assert_eq!(purge_finished_jobs(&pool, Utc::now() + seconds(1)).await?, 1);
    assert_matches!(get_job(&pool, done).await, Err(QueueError::JobNotFound(_)));
    assert_eq!(get_job(&pool, waiting).await?.state, JobState::Pending);

    let output = assert_some!(get_job_output(&pool, done).await?);
    assert_eq!(output.output, "kept\n");

    Ok(())
}
