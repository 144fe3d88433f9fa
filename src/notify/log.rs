//! Collaborators that only log, for dry runs and unconfigured deployments.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{AdminAlerter, Mailer};
use crate::error::NotificationError;
use crate::queue::DlqEntry;

/// Logs password reset emails instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_password_reset(
        &self,
        email: &str,
        _reset_token: &str,
    ) -> Result<(), NotificationError> {
        info!(email = %email, "Dry run: password reset email not sent");
        Ok(())
    }
}

/// Logs dead-letter alerts instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogAlerter;

#[async_trait]
impl AdminAlerter for LogAlerter {
    async fn send_dead_letter_alert(&self, entry: &DlqEntry) -> Result<(), NotificationError> {
        warn!(
            job_id = ?entry.job_id,
            recipient = ?entry.recipient(),
            attempts = entry.attempts_made,
            error = %entry.error,
            "Email permanently failed"
        );
        Ok(())
    }
}
