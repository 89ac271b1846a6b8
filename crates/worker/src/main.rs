//! Brandbase Background Worker
//!
//! Runs in one of three modes:
//! - default: scheduled jobs (billing invariant checks every 15 minutes, a
//!   heartbeat every 5 minutes)
//! - `check [name...]`: run invariant checks once and exit non-zero on violations
//! - `replay <event_id...>`: fetch events from the provider and reconcile them again

use std::time::Duration;

use brandbase_billing::{
    BillingError, InvariantCheckSummary, InvariantChecker, PgBillingReconciler, ViolationSeverity,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

/// Attempts per replayed event, including the first
const REPLAY_ATTEMPTS: usize = 3;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of an invariant run
fn log_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    for violation in &summary.violations {
        let workspace_ids = violation
            .workspace_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                workspace_ids = %workspace_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                workspace_ids = %workspace_ids,
                "{}",
                violation.description
            ),
        }
    }
}

/// Reconcile the given events again, retrying transient failures
async fn replay(pool: sqlx::PgPool, event_ids: &[String]) -> anyhow::Result<()> {
    let reconciler = PgBillingReconciler::from_env(pool)?;
    let mut failed = 0;

    for event_id in event_ids {
        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(REPLAY_ATTEMPTS - 1);

        let result = RetryIf::spawn(
            strategy,
            || reconciler.replay(event_id),
            |e: &BillingError| {
                if e.is_retryable() {
                    warn!(event_id = %event_id, error = %e, "Replay failed, retrying");
                }
                e.is_retryable()
            },
        )
        .await;

        match result {
            Ok(outcome) => info!(event_id = %event_id, outcome = ?outcome, "Event replayed"),
            Err(e) => {
                failed += 1;
                error!(
                    event_id = %event_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Event replay failed"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} events failed to replay", event_ids.len());
    }
    Ok(())
}

/// Run invariant checks once
async fn check(pool: sqlx::PgPool, names: &[String]) -> anyhow::Result<()> {
    let checker = InvariantChecker::new(pool);

    let summary = if names.is_empty() {
        checker.run_all_checks().await?
    } else {
        let available = InvariantChecker::available_checks();
        let mut violations = Vec::new();
        for name in names {
            if !available.contains(&name.as_str()) {
                anyhow::bail!("unknown invariant check: {name} (available: {})", available.join(", "));
            }
            violations.extend(checker.run_check(name).await?);
        }
        InvariantCheckSummary::from_violations(time::OffsetDateTime::now_utc(), names.len(), violations)
    };

    log_summary(&summary);
    if !summary.healthy {
        anyhow::bail!("{} invariant violations found", summary.violations.len());
    }
    Ok(())
}

/// Scheduled mode
async fn run_scheduler(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariant checks
    // Cron: every 15 minutes
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running scheduled billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (every 15 minutes)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Brandbase Worker started successfully with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Brandbase Worker");

    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((command, rest)) if command == "replay" => {
            if rest.is_empty() {
                anyhow::bail!("usage: brandbase-worker replay <event_id>...");
            }
            replay(pool, rest).await
        }
        Some((command, rest)) if command == "check" => check(pool, rest).await,
        Some((command, _)) => anyhow::bail!("unknown command: {command} (expected replay or check)"),
        None => run_scheduler(pool).await,
    }
}
