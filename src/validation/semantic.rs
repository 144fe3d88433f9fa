//! Semantic validation for configuration values.

use super::{ValidationIssue, ValidationResult};
use crate::config::model::AppConfig;
use crate::queue::Backoff;

/// Validates cross-field consistency of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let email = &config.queues.email;
    let dlq = &config.queues.dead_letter;

    if email.name == dlq.name {
        result.add(
            ValidationIssue::error(
                "queues.dead_letter.name",
                format!("Dead-letter queue shares its name with the email queue: '{}'", dlq.name),
            )
            .with_suggestion("Use a distinct name such as 'fleetflow-email-dlq'"),
        );
    }

    if dlq.concurrency > email.concurrency {
        result.add(
            ValidationIssue::warning(
                "queues.dead_letter.concurrency",
                format!(
                    "Dead-letter concurrency {} exceeds email concurrency {}",
                    dlq.concurrency, email.concurrency
                ),
            )
            .with_suggestion("Admin alerts are usually throttled below the primary pool"),
        );
    }

    if let Backoff::Exponential {
        delay_ms,
        max_delay_ms,
    } = email.backoff
    {
        if max_delay_ms < delay_ms {
            result.add(ValidationIssue::warning(
                "queues.email.backoff.max_delay_ms",
                format!(
                    "Max delay {}ms is below the base delay {}ms, every retry waits {}ms",
                    max_delay_ms, delay_ms, max_delay_ms
                ),
            ));
        }
    }

    match config.worker.job_timeout_secs {
        Some(timeout) if timeout >= config.worker.stall_timeout_secs => result.add(
            ValidationIssue::warning(
                "worker.stall_timeout_secs",
                "Stall timeout does not exceed the job timeout, slow jobs may run twice",
            )
            .with_suggestion("Set stall_timeout_secs well above job_timeout_secs"),
        ),
        Some(_) => {}
        None => result.add(
            ValidationIssue::warning(
                "worker.job_timeout_secs",
                format!(
                    "No job timeout set, attempts running past the {}s stall timeout may run twice",
                    config.worker.stall_timeout_secs
                ),
            )
            .with_suggestion("Set job_timeout_secs below stall_timeout_secs"),
        ),
    }

    if config.mail.smtp.is_none() {
        result.add(ValidationIssue::warning(
            "mail.smtp",
            "No SMTP relay configured, emails will only be logged",
        ));
    }

    if config.mail.admin_email.is_none() && config.alerts.discord.is_none() {
        result.add(
            ValidationIssue::warning(
                "alerts",
                "No admin email or Discord webhook configured, dead-letter alerts will only be logged",
            )
            .with_suggestion("Set mail.admin_email or alerts.discord.webhook_url"),
        );
    }

    if let Some(discord) = &config.alerts.discord {
        if !discord.webhook_url.starts_with("https://") {
            result.add(ValidationIssue::warning(
                "alerts.discord.webhook_url",
                "Discord webhook URL does not use https",
            ));
        }
    }

    if !config.mail.frontend_url.starts_with("http://")
        && !config.mail.frontend_url.starts_with("https://")
    {
        result.add(ValidationIssue::error(
            "mail.frontend_url",
            format!("Invalid frontend URL: '{}'", config.mail.frontend_url),
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_warnings(config: &AppConfig) -> Vec<String> {
        validate(config)
            .warnings()
            .filter(|i| i.path.starts_with("worker."))
            .map(|i| i.path.clone())
            .collect()
    }

    #[test]
    fn bounded_job_timeout_below_stall_is_quiet() {
        assert!(worker_warnings(&AppConfig::default()).is_empty());
    }

    #[test]
    fn unbounded_job_timeout_warns() {
        let mut config = AppConfig::default();
        config.worker.job_timeout_secs = None;
        assert_eq!(worker_warnings(&config), vec!["worker.job_timeout_secs"]);
    }

    #[test]
    fn job_timeout_at_stall_timeout_warns() {
        let mut config = AppConfig::default();
        config.worker.job_timeout_secs = Some(config.worker.stall_timeout_secs);
        assert_eq!(worker_warnings(&config), vec!["worker.stall_timeout_secs"]);
    }
}
