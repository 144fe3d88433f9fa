//! FleetFlow mail queue - asynchronous email delivery with retries and
//! dead-letter alerting.
//!
//! Request handlers enqueue password reset emails through a fire-and-forget
//! producer; a throttled worker pool delivers them, and emails that exhaust
//! their attempts are escalated to a dead-letter queue whose own pool alerts
//! an administrator.

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod queue;
pub mod validation;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, RunArgs};
use crate::config::{AppConfig, StoreBackend};
use crate::lifecycle::{MailQueueService, ServiceSettings};
use crate::notify::{
    AdminAlerter, DiscordAlerter, LogAlerter, LogMailer, Mailer, Metrics, MetricsServer,
    SmtpMailer,
};
use crate::queue::{add_password_reset_email, DlqEntry, JobState, JobStore, MemoryStore, RedisStore};

/// Runs the mail queue with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::Run(args) => run_service(args, &cli.config).await,
        Commands::ConfigValidate => validate_config(&cli.config),
        Commands::ConfigShow => show_config(&cli.config),
        Commands::QueueStats => queue_stats(&cli.config).await,
        Commands::SendReset { email, token } => send_reset(&cli.config, &email, &token).await,
        Commands::DeadLetterList { limit } => list_dead_letter(&cli.config, limit).await,
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Runs both worker pools until SIGINT or SIGTERM.
async fn run_service(args: RunArgs, config_path: &Path) -> Result<()> {
    info!("Starting mail queue");

    let config = config::load_and_validate(config_path)?;
    info!("Configuration loaded and validated");

    let store = open_store(&config).await?;
    let metrics = Arc::new(Metrics::new()?);
    let (mailer, alerter) = build_collaborators(&config, args.dry_run)?;

    if config.prometheus.enabled {
        let port = config.prometheus.port;
        let metrics_server = MetricsServer::new(metrics.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.start().await {
                error!(error = %e, "Prometheus server failed");
            }
        });
        info!(port, "Prometheus metrics server started");
    }

    let service = MailQueueService::new(
        ServiceSettings::from_config(&config),
        store,
        mailer,
        alerter,
        metrics,
    );
    service.start().await?;

    info!("Mail queue is running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await;

    service.stop().await;
    Ok(())
}

/// Opens the configured job store.
async fn open_store(config: &AppConfig) -> Result<Arc<dyn JobStore>> {
    match config.store {
        StoreBackend::Redis => {
            let store =
                RedisStore::new(&config.redis.connection_url(), &config.redis.key_prefix).await?;
            info!("Connected to Redis");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory job store, queued jobs are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Picks the mailer and admin alerter from configuration.
fn build_collaborators(
    config: &AppConfig,
    dry_run: bool,
) -> Result<(Arc<dyn Mailer>, Arc<dyn AdminAlerter>)> {
    if dry_run {
        info!("Dry run: emails and alerts are only logged");
        return Ok((Arc::new(LogMailer), Arc::new(LogAlerter)));
    }

    let smtp = config
        .mail
        .smtp
        .as_ref()
        .map(|smtp| {
            SmtpMailer::new(smtp, &config.mail.frontend_url, config.mail.admin_email.clone())
                .map(Arc::new)
        })
        .transpose()?;

    let mailer: Arc<dyn Mailer> = match &smtp {
        Some(smtp) => smtp.clone(),
        None => {
            warn!("No SMTP relay configured, password reset emails are only logged");
            Arc::new(LogMailer)
        }
    };

    let alerter: Arc<dyn AdminAlerter> = match (&config.alerts.discord, &smtp) {
        (Some(discord), _) => Arc::new(DiscordAlerter::new(discord)),
        (None, Some(smtp)) if config.mail.admin_email.is_some() => smtp.clone(),
        _ => {
            warn!("No admin alert channel configured, dead-letter alerts are only logged");
            Arc::new(LogAlerter)
        }
    };

    Ok((mailer, alerter))
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

/// Validates the configuration file and reports any issues.
fn validate_config(config_path: &Path) -> Result<()> {
    let mut config = config::load_or_default(config_path)?;
    config::apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;

    let result = validation::validate_config(&config);
    println!("{}", validation::report::format_report(&result));

    if !result.is_valid() {
        anyhow::bail!(error::ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    println!(
        "Email queue '{}' (concurrency {}, {} attempts), dead-letter queue '{}' (concurrency {})",
        config.queues.email.name,
        config.queues.email.concurrency,
        config.queues.email.max_attempts,
        config.queues.dead_letter.name,
        config.queues.dead_letter.concurrency,
    );
    Ok(())
}

/// Displays the effective configuration.
fn show_config(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

/// Prints job counts of both queues.
async fn queue_stats(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path)?;
    let store = open_store(&config).await?;

    for queue in [&config.queues.email.name, &config.queues.dead_letter.name] {
        let counts = store.counts(queue).await?;
        println!(
            "{}: {} waiting, {} active, {} completed, {} failed",
            queue, counts.waiting, counts.active, counts.completed, counts.failed
        );
    }

    Ok(())
}

/// Enqueues a single password reset email.
async fn send_reset(config_path: &Path, email: &str, token: &str) -> Result<()> {
    let config = config::load_and_validate(config_path)?;
    if config.store == StoreBackend::Memory {
        warn!("In-memory store selected, the job will not outlive this command");
    }
    let store = open_store(&config).await?;

    let job_id = add_password_reset_email(
        store.as_ref(),
        &config.queues.email.name,
        config.queues.email.job_options(),
        email,
        token,
    )
    .await?;

    println!("Enqueued password reset for {} as job {}.", email, job_id);
    Ok(())
}

/// Lists entries of the dead-letter queue.
async fn list_dead_letter(config_path: &Path, limit: usize) -> Result<()> {
    let config = config::load_and_validate(config_path)?;
    let store = open_store(&config).await?;
    let queue = &config.queues.dead_letter.name;

    let mut total = 0;
    for state in [JobState::Waiting, JobState::Active, JobState::Completed, JobState::Failed] {
        let jobs = store.list(queue, state, limit).await?;
        if jobs.is_empty() {
            continue;
        }

        println!("{} ({} entries):", state, jobs.len());
        for job in &jobs {
            match DlqEntry::from_job(job) {
                Ok(entry) => println!(
                    "  {} - job {} to {} after {} attempt(s): {}",
                    job.id,
                    entry.job_id.as_deref().unwrap_or("?"),
                    entry.recipient().unwrap_or("?"),
                    entry.attempts_made,
                    entry.error
                ),
                Err(e) => println!("  {} - unreadable entry: {}", job.id, e),
            }
        }
        total += jobs.len();
    }

    if total == 0 {
        println!("Dead-letter queue is empty.");
    }

    Ok(())
}
