//! Processor for the outbound email queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::pool::JobProcessor;
use crate::error::JobError;
use crate::notify::prometheus::Metrics;
use crate::notify::Mailer;
use crate::queue::{add_to_dlq, DlqEntry, EmailPayload, Failure, Job, JobOptions, JobStore};

/// Sends queued emails and hands exhausted jobs to the dead-letter queue.
pub struct EmailProcessor {
    mailer: Arc<dyn Mailer>,
    store: Arc<dyn JobStore>,
    dlq_queue: String,
    dlq_options: JobOptions,
    metrics: Arc<Metrics>,
}

impl EmailProcessor {
    /// Creates a processor escalating into `dlq_queue`.
    pub fn new(
        mailer: Arc<dyn Mailer>,
        store: Arc<dyn JobStore>,
        dlq_queue: impl Into<String>,
        dlq_options: JobOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            mailer,
            store,
            dlq_queue: dlq_queue.into(),
            dlq_options,
            metrics,
        }
    }
}

#[async_trait]
impl JobProcessor for EmailProcessor {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload = EmailPayload::from_job(job)?;

        match &payload {
            EmailPayload::ForgotPassword {
                email, reset_token, ..
            } => {
                self.mailer.send_password_reset(email, reset_token).await?;
                info!(job_id = %job.id, tag = payload.tag(), email = %email, "Email sent");
            }
        }

        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, failure: &Failure) {
        let entry = DlqEntry::from_failed_job(job, failure);

        match add_to_dlq(self.store.as_ref(), &self.dlq_queue, self.dlq_options, &entry).await {
            Ok(_) => self.metrics.record_outcome(&job.queue, "dead_lettered"),
            Err(e) => error!(
                job_id = %job.id,
                error = %e,
                "Failed to hand exhausted job to dead-letter queue"
            ),
        }
    }
}
