//! jobq CLI: run the worker, enqueue and inspect jobs, check the backlog.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq::config::Config;
use jobq::config::secrets::ExposeSecret;
use jobq::db::Db;
use jobq::model::{JobId, JobType, NewJob};
use jobq::monitor::BacklogMonitor;
use jobq::poller::{PollOptions, wait_for_job};
use jobq::processor::CommandHandler;
use jobq::shutdown::cancel_on_signal;
use jobq::store::JobStore;
use jobq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use jobq::worker::{Kicker, Worker};
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "jobq", about = "Durable background jobs on Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Run the worker loop and backlog monitor until SIGTERM/SIGINT
    Worker {
        /// Handlers file (overrides JOB_HANDLERS_FILE)
        #[arg(long)]
        handlers: Option<PathBuf>,
    },
    /// Enqueue a job
    Enqueue {
        /// Job type, e.g. meeting-rescan
        job_type: String,
        /// Owning user id
        #[arg(long)]
        user: String,
        /// JSON object payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        correlation_id: Option<String>,
        /// Block until the job finishes or the wait timeout passes
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 30_000)]
        wait_timeout_ms: u64,
        #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
        poll_interval_ms: u64,
    },
    /// Show one job
    Show {
        /// Job id (UUID)
        id: String,
    },
    /// Print backlog counts; exits 2 when the backlog is critical
    Backlog {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Requeue or fail running jobs whose lease has expired
    Reclaim,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init(&config, &cli.command)?;

    let db = Db::connect(config.database_url.expose_secret())
        .await?
        .with_settings(config.queue);

    match cli.command {
        Command::Migrate => {
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Worker { handlers } => {
            let handlers = handlers.unwrap_or_else(|| config.handlers_file.clone());
            cmd_worker(db, &config, handlers).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Enqueue {
            job_type,
            user,
            payload,
            max_attempts,
            correlation_id,
            wait,
            wait_timeout_ms,
            poll_interval_ms,
        } => {
            let job_type: JobType = job_type.parse()?;
            let mut new = NewJob::new(job_type, user);
            if let Some(json) = payload {
                new = new.payload(serde_json::from_str(&json)?);
            }
            if let Some(n) = max_attempts {
                new = new.max_attempts(n);
            }
            if let Some(id) = correlation_id {
                new = new.correlation_id(id);
            }
            let options = wait.then(|| PollOptions {
                interval: Duration::from_millis(poll_interval_ms),
                timeout: Duration::from_millis(wait_timeout_ms),
            });
            cmd_enqueue(&db, new, options).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { id } => {
            cmd_show(&db, id.parse()?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Backlog { json } => cmd_backlog(db, &config, json).await,
        Command::Reclaim => {
            let reclaimed = db.reclaim_expired().await?;
            for job in &reclaimed {
                println!(
                    "{}  {:<24}  {:<8}  attempts {}/{}",
                    job.id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.attempts,
                    job.max_attempts
                );
            }
            println!("{} job(s) reclaimed", reclaimed.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Only the long-running worker exports to OTLP; one-shot commands log to
/// stderr.
fn init(config: &Config, command: &Command) -> anyhow::Result<TelemetryGuard> {
    let endpoint = match command {
        Command::Worker { .. } => config.otel_endpoint.clone(),
        _ => None,
    };
    Ok(init_telemetry(TelemetryConfig {
        endpoint,
        service_name: "jobq".to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

async fn cmd_worker(db: Db, config: &Config, handlers: PathBuf) -> anyhow::Result<()> {
    db.migrate().await?;

    // Refuse to start unless every job type has a handler.
    let processor = CommandHandler::load_registry(&handlers)?.build()?;
    info!(handlers = %handlers.display(), "handler table complete");

    let listener = db.job_listener().await?;
    let store: Arc<dyn JobStore> = Arc::new(db);
    let worker = Worker::new(Arc::clone(&store), Arc::new(processor), config.worker.clone());

    let shutdown = CancellationToken::new();

    let signals = tokio::spawn({
        let token = shutdown.clone();
        async move {
            if let Err(e) = cancel_on_signal(token).await {
                error!(error = %e, "cannot install signal handlers");
            }
        }
    });

    let notifications = tokio::spawn(forward_notifications(
        listener,
        worker.kicker(),
        shutdown.clone(),
    ));

    let monitor = BacklogMonitor::new(Arc::clone(&store), config.backlog);
    let monitoring = tokio::spawn({
        let token = shutdown.clone();
        let interval = config.backlog_log_interval;
        async move { monitor.run(interval, token).await }
    });

    worker.run(shutdown.clone()).await;

    shutdown.cancel();
    let (signals, notifications, monitoring) = tokio::join!(signals, notifications, monitoring);
    for (task, joined) in [
        ("signals", signals),
        ("notifications", notifications),
        ("monitor", monitoring),
    ] {
        if let Err(e) = joined {
            error!(task, error = %e, "background task ended abnormally");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Kick the worker whenever an enqueue commits.
async fn forward_notifications(mut listener: PgListener, kicker: Kicker, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = listener.recv() => match received {
                Ok(_) => kicker.kick(),
                Err(e) => {
                    warn!(error = %e, "job notification listener failed, relying on polling");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }
    }
}

async fn cmd_enqueue(db: &Db, new: NewJob, wait: Option<PollOptions>) -> anyhow::Result<()> {
    let job = db.enqueue(new).await?;
    println!("Enqueued: {} ({}, correlation {})", job.id, job.job_type, job.correlation_id);

    if let Some(options) = wait {
        let done = wait_for_job(db, job.id, options).await?;
        println!(
            "Result:     {}",
            serde_json::to_string_pretty(&done.result.unwrap_or_default())?
        );
    }
    Ok(())
}

async fn cmd_show(db: &Db, id: JobId) -> anyhow::Result<()> {
    let job = db.get(id).await?;

    println!("ID:          {}", job.id);
    println!("Type:        {}", job.job_type);
    println!("Status:      {}", job.status);
    println!("User:        {}", job.user_id);
    println!("Correlation: {}", job.correlation_id);
    println!("Attempts:    {}/{}", job.attempts, job.max_attempts);
    println!("Next Run:    {}", job.next_run_at);
    if let Some(lease) = job.lease_expires_at {
        println!("Lease Until: {lease}");
    }
    println!("Payload:     {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Created:     {}", job.created_at);
    println!("Updated:     {}", job.updated_at);
    if let Some(ref result) = job.result {
        println!("---");
        println!("Result:      {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref err) = job.error {
        println!("---");
        println!("Error:       {}", err.message);
        if let Some(ref cause) = err.cause {
            println!("Cause:       {cause}");
        }
    }
    Ok(())
}

async fn cmd_backlog(db: Db, config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    let store: Arc<dyn JobStore> = Arc::new(db);
    let snapshot = BacklogMonitor::new(store, config.backlog).check().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let c = &snapshot.counts;
        println!("Level:     {}", snapshot.level);
        println!("Queued:    {}", c.queued);
        println!("Running:   {}", c.running);
        println!("Succeeded: {}", c.succeeded);
        println!("Failed:    {}", c.failed);
        println!("Stale:     {}", c.stale);
        match c.oldest_queued_age_ms {
            Some(ms) => println!("Oldest:    {ms}ms"),
            None => println!("Oldest:    -"),
        }
    }

    Ok(ExitCode::from(snapshot.exit_code() as u8))
}
