//! Storage abstraction shared by all queues.

use std::time::Duration;

use async_trait::async_trait;

use super::job::{Failure, Job, JobCounts, JobState, NewJob};
use crate::error::QueueError;

/// Durable job storage keyed by queue name.
///
/// Every state transition is atomic with respect to concurrent callers:
/// a waiting job is handed to exactly one `dequeue_next` caller.
///
/// The finishing calls take the job returned by `dequeue_next` as the claim.
/// They fail with [`QueueError::NotActive`] when the job is not active and
/// with [`QueueError::ClaimLost`] when it was recovered as stalled and
/// claimed again since.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Adds a job and returns its id.
    async fn enqueue(&self, job: NewJob) -> Result<String, QueueError>;

    /// Claims the next available waiting job (lowest priority value, oldest first).
    async fn dequeue_next(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// Records a successful attempt on a claimed job.
    async fn mark_completed(&self, claim: &Job) -> Result<Job, QueueError>;

    /// Records a terminal failure on a claimed job.
    async fn mark_failed(&self, claim: &Job, failure: &Failure) -> Result<Job, QueueError>;

    /// Records a failed attempt and makes the job claimable again after its backoff.
    async fn reschedule_with_backoff(
        &self,
        claim: &Job,
        failure: &Failure,
    ) -> Result<Job, QueueError>;

    /// Returns the number of jobs per state.
    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    /// Gets a job by its id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Lists up to `limit` jobs of a queue in the given state, oldest first.
    async fn list(&self, queue: &str, state: JobState, limit: usize)
        -> Result<Vec<Job>, QueueError>;

    /// Moves jobs active for longer than `stalled_for` back to waiting.
    async fn recover_stalled(&self, queue: &str, stalled_for: Duration)
        -> Result<usize, QueueError>;
}
