//! Outbound mail, admin alerts and Prometheus metrics.

pub mod discord;
pub mod log;
pub mod prometheus;
pub mod smtp;

use async_trait::async_trait;

use crate::error::NotificationError;
use crate::queue::DlqEntry;

pub use discord::DiscordAlerter;
pub use log::{LogAlerter, LogMailer};
pub use prometheus::{Metrics, MetricsServer};
pub use smtp::SmtpMailer;

/// Delivers user-facing emails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends the password reset email carrying `reset_token`.
    async fn send_password_reset(
        &self,
        email: &str,
        reset_token: &str,
    ) -> Result<(), NotificationError>;
}

/// Tells an administrator about an email that exhausted its attempts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdminAlerter: Send + Sync {
    async fn send_dead_letter_alert(&self, entry: &DlqEntry) -> Result<(), NotificationError>;
}
