//! Processor for the dead-letter queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::pool::JobProcessor;
use crate::error::JobError;
use crate::notify::AdminAlerter;
use crate::queue::{DlqEntry, Failure, Job};

/// Sends one admin alert per dead-letter entry.
///
/// Alert failures are logged and dropped: DLQ jobs run once and never
/// produce further dead-letter entries.
pub struct DeadLetterProcessor {
    alerter: Arc<dyn AdminAlerter>,
}

impl DeadLetterProcessor {
    pub fn new(alerter: Arc<dyn AdminAlerter>) -> Self {
        Self { alerter }
    }
}

#[async_trait]
impl JobProcessor for DeadLetterProcessor {
    fn name(&self) -> &'static str {
        "dead_letter"
    }

    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let entry = DlqEntry::from_job(job)?;
        self.alerter.send_dead_letter_alert(&entry).await?;

        info!(
            job_id = %job.id,
            original_job_id = ?entry.job_id,
            recipient = ?entry.recipient(),
            "Dead-letter alert sent"
        );
        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, failure: &Failure) {
        error!(
            job_id = %job.id,
            error = %failure.message,
            "Dead-letter alert failed, dropping entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use crate::notify::MockAdminAlerter;
    use crate::queue::{EmailPayload, JobOptions, NewJob};

    fn dlq_job() -> Job {
        let entry = DlqEntry {
            original_job: EmailPayload::forgot_password("bob@example.com", "t").to_value(),
            error: "mailbox unavailable".to_string(),
            stack: Some("caused by: 550".to_string()),
            timestamp: chrono::Utc::now(),
            attempts_made: 3,
            job_id: Some("42".to_string()),
        };
        Job::from_request(
            NewJob {
                queue: "dlq".to_string(),
                name: "dlq:failed_email".to_string(),
                payload: serde_json::to_value(&entry).unwrap(),
                options: JobOptions {
                    max_attempts: 1,
                    ..JobOptions::default()
                },
            },
            1,
        )
    }

    #[tokio::test]
    async fn alert_receives_the_full_entry() {
        let mut alerter = MockAdminAlerter::new();
        alerter
            .expect_send_dead_letter_alert()
            .withf(|entry| {
                entry.recipient() == Some("bob@example.com")
                    && entry.attempts_made == 3
                    && entry.stack.as_deref() == Some("caused by: 550")
            })
            .times(1)
            .returning(|_| Ok(()));

        let processor = DeadLetterProcessor::new(Arc::new(alerter));
        tokio_test::assert_ok!(processor.process(&dlq_job()).await);
    }

    #[tokio::test]
    async fn alert_failure_is_reported_as_job_error() {
        let mut alerter = MockAdminAlerter::new();
        alerter
            .expect_send_dead_letter_alert()
            .returning(|_| Err(NotificationError::DiscordFailed("HTTP 500".to_string())));

        let processor = DeadLetterProcessor::new(Arc::new(alerter));
        assert!(processor.process(&dlq_job()).await.is_err());
    }
}
