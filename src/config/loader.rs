//! Configuration file loading and parsing.

use std::path::Path;

use anyhow::{Context, Result};

use super::model::{AppConfig, DiscordConfig, SmtpConfig};
use crate::error::ConfigError;
use crate::validation::report::{format_brief_summary, format_report};
use crate::validation::validate_config;

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(config)
}

/// Loads the configuration file, falling back to defaults when it does not exist.
pub fn load_or_default(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(AppConfig::default());
    }
    load_from_path(path)
}

/// Applies environment overrides using the given variable lookup.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("REDIS_URL") {
        config.redis.url = Some(url);
    }
    if let Some(url) = lookup("FRONTEND_URL") {
        config.mail.frontend_url = url;
    }
    if let Some(email) = lookup("ADMIN_EMAIL") {
        config.mail.admin_email = Some(email);
    }

    if let Some(host) = lookup("SMTP_HOST") {
        let from_email = lookup("SMTP_FROM_EMAIL")
            .or_else(|| config.mail.smtp.as_ref().map(|s| s.from_email.clone()))
            .ok_or_else(|| ConfigError::InvalidEnv {
                var: "SMTP_FROM_EMAIL".to_string(),
                message: "required when SMTP_HOST is set".to_string(),
            })?;
        let smtp = config.mail.smtp.get_or_insert_with(|| SmtpConfig {
            host: String::new(),
            port: 587,
            username: None,
            password: None,
            from_email: String::new(),
            from_name: "FleetFlow".to_string(),
            use_tls: true,
        });
        smtp.host = host;
        smtp.from_email = from_email;
    }

    if let Some(smtp) = config.mail.smtp.as_mut() {
        if let Some(port) = lookup("SMTP_PORT") {
            smtp.port = parse_env("SMTP_PORT", &port)?;
        }
        if let Some(username) = lookup("SMTP_USERNAME") {
            smtp.username = Some(username);
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            smtp.password = Some(password);
        }
        if let Some(from_email) = lookup("SMTP_FROM_EMAIL") {
            smtp.from_email = from_email;
        }
    }

    if let Some(webhook_url) = lookup("DISCORD_WEBHOOK_URL") {
        match config.alerts.discord.as_mut() {
            Some(discord) => discord.webhook_url = webhook_url,
            None => {
                config.alerts.discord = Some(DiscordConfig {
                    webhook_url,
                    mention_on_failure: None,
                })
            }
        }
    }

    if let Some(value) = lookup("EMAIL_CONCURRENCY") {
        config.queues.email.concurrency = parse_env("EMAIL_CONCURRENCY", &value)?;
    }
    if let Some(value) = lookup("DLQ_CONCURRENCY") {
        config.queues.dead_letter.concurrency = parse_env("DLQ_CONCURRENCY", &value)?;
    }

    Ok(())
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        message: e.to_string(),
    })
}

/// Loads, overrides from the process environment, and fully validates the configuration.
pub fn load_and_validate(path: &Path) -> Result<AppConfig> {
    let mut config = load_or_default(path).context("Failed to load configuration")?;
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())
        .context("Failed to apply environment overrides")?;

    let result = validate_config(&config);

    for issue in result.warnings() {
        tracing::warn!(
            path = %issue.path,
            message = %issue.message,
            suggestion = ?issue.suggestion,
            "Config validation warning"
        );
    }

    let error_count = result.error_count();
    if error_count > 0 {
        tracing::error!("{}", format_report(&result));
        anyhow::bail!(ConfigError::ValidationFailed { error_count });
    }

    tracing::debug!(summary = %format_brief_summary(&result), "Config loaded");
    Ok(config)
}
