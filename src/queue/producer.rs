//! Producer-facing entry points for the email and dead-letter queues.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::job::{JobOptions, NewJob};
use super::payload::{DlqEntry, EmailPayload, DEAD_LETTER_JOB, FORGOT_PASSWORD_JOB};
use super::store::JobStore;
use crate::error::QueueError;
use crate::notify::prometheus::Metrics;

/// Enqueues a password reset email and returns the job id.
pub async fn add_password_reset_email(
    store: &dyn JobStore,
    queue: &str,
    options: JobOptions,
    email: &str,
    reset_token: &str,
) -> Result<String, QueueError> {
    let job_id = store
        .enqueue(password_reset_job(queue, options, email, reset_token))
        .await?;
    info!(job_id = %job_id, queue, email, "Password reset email queued");
    Ok(job_id)
}

/// Enqueues a dead-letter entry; DLQ jobs are never retried.
pub async fn add_to_dlq(
    store: &dyn JobStore,
    queue: &str,
    options: JobOptions,
    entry: &DlqEntry,
) -> Result<String, QueueError> {
    let payload =
        serde_json::to_value(entry).map_err(|e| QueueError::SerializationFailed(e.to_string()))?;

    let job_id = store
        .enqueue(NewJob {
            queue: queue.to_string(),
            name: DEAD_LETTER_JOB.to_string(),
            payload,
            options: JobOptions {
                max_attempts: 1,
                ..options
            },
        })
        .await?;

    let error: String = entry.error.chars().take(100).collect();
    warn!(
        job_id = %job_id,
        original_job_id = ?entry.job_id,
        attempts = entry.attempts_made,
        error = %error,
        "Failed job added to dead-letter queue"
    );
    Ok(job_id)
}

fn password_reset_job(queue: &str, options: JobOptions, email: &str, reset_token: &str) -> NewJob {
    NewJob {
        queue: queue.to_string(),
        name: FORGOT_PASSWORD_JOB.to_string(),
        payload: EmailPayload::forgot_password(email, reset_token).to_value(),
        options,
    }
}

/// Fire-and-forget handle used by request handlers.
///
/// Sends never wait on the store; jobs are handed to the
/// [`EnqueueForwarder`] through a bounded channel.
#[derive(Clone)]
pub struct MailProducer {
    tx: mpsc::Sender<NewJob>,
    queue: String,
    options: JobOptions,
}

impl MailProducer {
    /// Creates a producer and the receiving end for its forwarder.
    pub fn channel(
        queue: &str,
        options: JobOptions,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<NewJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                queue: queue.to_string(),
                options,
            },
            rx,
        )
    }

    /// Queues a password reset email without waiting for the store.
    pub fn enqueue_password_reset(&self, email: &str, reset_token: &str) -> Result<(), QueueError> {
        self.tx
            .try_send(password_reset_job(&self.queue, self.options, email, reset_token))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::ProducerFull,
                mpsc::error::TrySendError::Closed(_) => QueueError::ProducerClosed,
            })
    }
}

/// Drains the producer channel into the job store.
pub struct EnqueueForwarder {
    rx: mpsc::Receiver<NewJob>,
    store: Arc<dyn JobStore>,
    metrics: Arc<Metrics>,
}

impl EnqueueForwarder {
    /// Creates a forwarder over a producer channel.
    pub fn new(rx: mpsc::Receiver<NewJob>, store: Arc<dyn JobStore>, metrics: Arc<Metrics>) -> Self {
        Self { rx, store, metrics }
    }

    /// Forwards jobs until shutdown, then flushes what is already buffered.
    ///
    /// Returns the receiver so the forwarder can be started again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<NewJob> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                job = self.rx.recv() => match job {
                    Some(job) => self.forward(job).await,
                    None => break,
                },
            }
        }

        while let Ok(job) = self.rx.try_recv() {
            self.forward(job).await;
        }

        self.rx
    }

    async fn forward(&self, job: NewJob) {
        let queue = job.queue.clone();
        let name = job.name.clone();
        match self.store.enqueue(job).await {
            Ok(job_id) => {
                self.metrics.record_enqueued(&queue);
                info!(job_id = %job_id, queue = %queue, name = %name, "Job enqueued");
            }
            Err(e) => {
                error!(queue = %queue, name = %name, error = %e, "Failed to enqueue job");
            }
        }
    }
}
