use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use qq::{
    JobFilter, JobState, NewJob, QueueError, Runner, ShellRunner, WorkerConfig, cancel_job,
    get_job_output, get_queue_stats, list_jobs, setup_database,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// A simple job queue for executing bash commands, backed by PostgreSQL.
#[derive(Parser)]
#[command(name = "qq", author, version, about, long_about = None)]
struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue tables
    Init,
    /// Run jobs until interrupted
    Worker(WorkerArgs),
    /// Manage jobs
    #[command(subcommand)]
    Job(JobCommand),
    /// Inspect queues
    #[command(subcommand)]
    Queue(QueueCommand),
}

#[derive(Args)]
struct WorkerArgs {
    /// Queues to work on
    #[arg(short, long = "queue", env = "QQ_QUEUE", value_delimiter = ',', default_value = qq::DEFAULT_QUEUE)]
    queues: Vec<String>,

    /// Number of jobs to run concurrently per queue
    #[arg(short, long, env = "QQ_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// How often idle workers poll for jobs (e.g. 500ms, 2s)
    #[arg(short, long, env = "QQ_POLL_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    interval: Duration,

    /// Lifetime of a lease that isn't renewed
    #[arg(long, env = "QQ_LEASE_DURATION", default_value = "30s", value_parser = parse_duration)]
    lease_duration: Duration,

    /// Delay before the first retry, doubled on every further attempt
    #[arg(long, env = "QQ_BACKOFF_BASE", default_value = "1s", value_parser = parse_duration)]
    backoff_base: Duration,

    /// Longest delay between two attempts
    #[arg(long, env = "QQ_BACKOFF_CAP", default_value = "1h", value_parser = parse_duration)]
    backoff_cap: Duration,

    /// Kill commands running longer than this
    #[arg(long, env = "QQ_JOB_TIMEOUT", value_parser = parse_duration)]
    job_timeout: Option<Duration>,

    /// Output kept per attempt, in bytes
    #[arg(long, env = "QQ_MAX_OUTPUT_BYTES", default_value_t = qq::executor::DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// How long running commands may take to finish on shutdown
    #[arg(long, env = "QQ_SHUTDOWN_GRACE", default_value = "30s", value_parser = parse_duration)]
    shutdown_grace: Duration,
}

#[derive(Subcommand)]
enum JobCommand {
    /// Add a job to a queue
    Add {
        /// The command to run, use `--` before commands starting with a dash
        #[arg(required = true)]
        command: Vec<String>,

        /// Queue to add the job to
        #[arg(short, long, default_value = qq::DEFAULT_QUEUE)]
        queue: String,

        /// Job priority (lower numbers run first)
        #[arg(short, long, default_value_t = qq::DEFAULT_PRIORITY.into(), allow_negative_numbers = true)]
        priority: i32,

        /// Don't run before this time (RFC 3339)
        #[arg(short, long)]
        schedule: Option<DateTime<Utc>>,

        /// Attempts before the job is marked failed
        #[arg(short, long, env = "QQ_MAX_ATTEMPTS", default_value_t = qq::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: i32,
    },
    /// List jobs, newest first
    Ls {
        /// Only jobs of this queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Only jobs in this state
        #[arg(short, long)]
        status: Option<JobState>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = qq::query::DEFAULT_LIST_LIMIT)]
        limit: i64,
    },
    /// Print the output of the latest attempt of a job
    Output {
        /// Job id
        id: i64,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a job that hasn't finished
    Rm {
        /// Job id
        id: i64,

        /// Also cancel the job if it is running
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Show job counts per state
    Stats {
        /// Only this queue
        queue: Option<String>,

        /// Print the counts as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,qq=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let db_url = cli
        .db_url
        .context("database URL is required, pass --db-url or set DATABASE_URL")?;

    let max_connections = match &cli.command {
        Command::Worker(args) => u32::try_from(args.concurrency * args.queues.len())
            .unwrap_or(u32::MAX)
            .saturating_add(2),
        _ => 2,
    };
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&db_url)
        .await
        .context("failed to connect to the database")?;

    match cli.command {
        Command::Init => {
            setup_database(&pool).await?;
            println!("Initialization complete! The database is now ready for use.");
        }
        Command::Worker(args) => run_worker(pool, args).await?,
        Command::Job(command) => run_job_command(&pool, command).await?,
        Command::Queue(QueueCommand::Stats { queue, json }) => {
            let stats = get_queue_stats(&pool, queue.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            if stats.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            println!(
                "{:<20} {:>8} {:>8} {:>8} {:>10} {:>8} {:>10}",
                "QUEUE", "PENDING", "LEASED", "RUNNING", "COMPLETED", "FAILED", "CANCELLED"
            );
            for (queue, s) in stats {
                println!(
                    "{queue:<20} {:>8} {:>8} {:>8} {:>10} {:>8} {:>10}",
                    s.pending, s.leased, s.running, s.completed, s.failed, s.cancelled
                );
            }
        }
    }

    Ok(())
}

async fn run_worker(pool: PgPool, args: WorkerArgs) -> Result<()> {
    setup_database(&pool)
        .await
        .context("failed to initialize the job schema")?;

    let command_runner = ShellRunner::default().max_output_bytes(args.max_output_bytes);
    let config = WorkerConfig::default()
        .concurrency(args.concurrency)
        .poll_interval(args.interval)
        .lease_duration(args.lease_duration)
        .backoff(args.backoff_base, args.backoff_cap)
        .job_timeout(args.job_timeout);

    let mut queues = args.queues.iter();
    let first = queues.next().context("at least one queue is required")?;
    let mut runner = Runner::new(pool, command_runner).configure_queue(first, |_| config.clone());
    for queue in queues {
        runner = runner.configure_queue(queue, |_| config.clone());
    }

    info!(
        queues = ?args.queues,
        concurrency = args.concurrency,
        "Worker is running"
    );
    let handle = runner.start();

    wait_for_shutdown_signal().await?;
    handle.shutdown(args.shutdown_grace).await;
    Ok(())
}

async fn run_job_command(pool: &PgPool, command: JobCommand) -> Result<()> {
    match command {
        JobCommand::Add {
            command,
            queue,
            priority,
            schedule,
            max_attempts,
        } => {
            let command = command.join(" ");
            let mut job = NewJob::new(&command)
                .queue(&queue)
                .priority(priority)
                .max_attempts(max_attempts);
            if let Some(at) = schedule {
                job = job.scheduled_at(at);
            }
            let id = job.enqueue(pool).await?;

            println!("Added job to queue {queue} with priority {priority}");
            println!("Job ID: {id}");
            println!("Job command: {command}");
            if let Some(at) = schedule {
                println!("Scheduled for: {}", at.to_rfc3339());
            }
        }
        JobCommand::Ls {
            queue,
            status,
            limit,
        } => {
            let filter = JobFilter {
                queue,
                state: status,
                limit,
            };
            let jobs = list_jobs(pool, &filter).await?;
            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }

            println!(
                "{:<8} {:<12} {:<10} {:>4} {:>8} {:>5} {:<25} COMMAND",
                "ID", "QUEUE", "STATE", "PRIO", "ATTEMPTS", "EXIT", "CREATED"
            );
            for summary in jobs {
                let job = summary.job;
                let exit_code = summary
                    .exit_code
                    .map_or_else(|| "-".to_string(), |code| code.to_string());
                println!(
                    "{:<8} {:<12} {:<10} {:>4} {:>8} {:>5} {:<25} {}",
                    job.id,
                    job.queue,
                    job.state,
                    job.priority,
                    format!("{}/{}", job.attempt, job.max_attempts),
                    exit_code,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&job.command, 60),
                );
            }
        }
        JobCommand::Output { id, json } => match get_job_output(pool, id).await? {
            Some(output) if json => println!("{}", serde_json::to_string_pretty(&output)?),
            Some(output) => {
                println!(
                    "Job {id}, attempt {} (exit code {})",
                    output.attempt, output.exit_code
                );
                print!("{}", output.output);
            }
            None => println!("Job {id} has no output yet"),
        },
        JobCommand::Rm { id, force } => match cancel_job(pool, id, force).await {
            Ok(previous) => println!("Cancelled job {id} (was {previous})"),
            Err(QueueError::InvalidStateTransition { from, .. }) if from == JobState::Running => {
                anyhow::bail!("job {id} is running, use --force to cancel it anyway");
            }
            Err(error) => return Err(error.into()),
        },
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Parses `250ms`, `2s`, `1.5m`, `1h` or a bare number of seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration `{value}`"))?;
    let seconds = match unit {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("unknown unit in duration `{value}`")),
    };

    Duration::try_from_secs_f64(seconds).map_err(|error| format!("invalid duration `{value}`: {error}"))
}
