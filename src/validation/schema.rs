//! Schema validation for configuration structure.

use super::{ValidationIssue, ValidationResult};
use crate::config::model::{AppConfig, RateLimitConfig, StoreBackend};
use crate::queue::redis::MAX_PRIORITY;

/// Validates required fields and value ranges.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let email = &config.queues.email;
    let dlq = &config.queues.dead_letter;

    for (path, name) in [
        ("queues.email.name", &email.name),
        ("queues.dead_letter.name", &dlq.name),
    ] {
        if name.trim().is_empty() {
            result.add(ValidationIssue::error(path, "Queue name cannot be empty"));
        }
    }

    for (path, concurrency) in [
        ("queues.email.concurrency", email.concurrency),
        ("queues.dead_letter.concurrency", dlq.concurrency),
    ] {
        if concurrency == 0 {
            result.add(ValidationIssue::error(path, "Concurrency must be at least 1"));
        }
    }

    validate_rate_limit("queues.email.rate_limit", &email.rate_limit, &mut result);
    validate_rate_limit("queues.dead_letter.rate_limit", &dlq.rate_limit, &mut result);

    if email.max_attempts == 0 {
        result.add(
            ValidationIssue::error("queues.email.max_attempts", "Max attempts must be at least 1")
                .with_suggestion("Use 1 to disable retries"),
        );
    }

    for (path, priority) in [
        ("queues.email.priority", email.priority),
        ("queues.dead_letter.priority", dlq.priority),
    ] {
        if priority > MAX_PRIORITY {
            result.add(
                ValidationIssue::error(path, format!("Priority {} is out of range", priority))
                    .with_suggestion(format!("Priority must be between 0 and {}", MAX_PRIORITY)),
            );
        }
    }

    if email.producer_capacity == 0 {
        result.add(ValidationIssue::error(
            "queues.email.producer_capacity",
            "Producer capacity must be at least 1",
        ));
    }

    if config.worker.poll_interval_ms == 0 {
        result.add(ValidationIssue::error(
            "worker.poll_interval_ms",
            "Poll interval must be greater than 0",
        ));
    }

    if config.worker.stall_timeout_secs == 0 {
        result.add(ValidationIssue::error(
            "worker.stall_timeout_secs",
            "Stall timeout must be greater than 0",
        ));
    }

    if config.store == StoreBackend::Redis && config.redis.key_prefix.trim().is_empty() {
        result.add(ValidationIssue::error(
            "redis.key_prefix",
            "Key prefix cannot be empty",
        ));
    }

    if let Some(smtp) = &config.mail.smtp {
        if smtp.host.trim().is_empty() {
            result.add(ValidationIssue::error("mail.smtp.host", "SMTP host is required"));
        }
        if !smtp.from_email.contains('@') {
            result.add(ValidationIssue::error(
                "mail.smtp.from_email",
                format!("Invalid sender address: '{}'", smtp.from_email),
            ));
        }
    }

    result
}

fn validate_rate_limit(path: &str, rate: &RateLimitConfig, result: &mut ValidationResult) {
    if rate.max == 0 {
        result.add(ValidationIssue::error(
            format!("{}.max", path),
            "Rate limit must allow at least 1 job per window",
        ));
    }
    if rate.duration_ms == 0 {
        result.add(ValidationIssue::error(
            format!("{}.duration_ms", path),
            "Rate limit window must be greater than 0",
        ));
    }
}
