//! Job records, enqueue options and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work held by a [`JobStore`](super::JobStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: String,

    /// Name of the queue the job belongs to.
    pub queue: String,

    /// Job name, e.g. `email:forgot_password`.
    pub name: String,

    /// Tagged job payload.
    pub payload: serde_json::Value,

    /// Claim priority; lower values are claimed first.
    pub priority: u32,

    /// Store-assigned enqueue sequence, used as FIFO tie-break.
    pub seq: u64,

    /// Number of finished attempts.
    pub attempts_made: u32,

    /// Maximum number of attempts before the job is terminal.
    pub max_attempts: u32,

    /// Delay policy between attempts.
    pub backoff: Backoff,

    /// How many finished jobs of this kind to keep.
    pub retention: Retention,

    /// Current lifecycle state.
    pub state: JobState,

    /// Timestamp when the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent claim.
    pub processed_at: Option<DateTime<Utc>>,

    /// Timestamp when the job completed.
    pub completed_at: Option<DateTime<Utc>>,

    /// Timestamp when the job failed terminally.
    pub failed_at: Option<DateTime<Utc>>,

    /// Earliest time the job may be claimed again.
    pub available_at: DateTime<Utc>,

    /// Error message of the most recent failed attempt.
    pub last_error: Option<String>,

    /// Token of the current claim; only its holder may record the attempt.
    #[serde(default)]
    pub lock_token: Option<String>,
}

/// Creates a fresh claim token.
pub fn new_lock_token() -> String {
    Uuid::new_v4().to_string()
}

impl Job {
    /// Builds a waiting job from an enqueue request.
    pub fn from_request(request: NewJob, seq: u64) -> Self {
        let now = Utc::now();
        let options = request.options;
        Self {
            id: Uuid::new_v4().to_string(),
            queue: request.queue,
            name: request.name,
            payload: request.payload,
            priority: options.priority,
            seq,
            attempts_made: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            retention: options.retention,
            state: JobState::Waiting,
            created_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            available_at: now,
            last_error: None,
            lock_token: None,
        }
    }

    /// Returns true if another attempt is allowed after the current one fails.
    pub fn has_retries_left(&self) -> bool {
        self.attempts_made + 1 < self.max_attempts
    }

    /// Marks the job as claimed by a worker holding `lock_token`.
    pub fn activate(&mut self, lock_token: String) {
        self.state = JobState::Active;
        self.processed_at = Some(Utc::now());
        self.lock_token = Some(lock_token);
    }

    /// Returns true if `claim` was handed out by the current claim of this job.
    pub fn is_claimed_by(&self, claim: &Job) -> bool {
        self.lock_token.is_some() && self.lock_token == claim.lock_token
    }

    /// Marks the job as completed successfully.
    pub fn complete(&mut self) {
        self.record_attempt();
        self.state = JobState::Completed;
        self.completed_at = Some(Utc::now());
        self.lock_token = None;
    }

    /// Marks the job as terminally failed.
    pub fn fail(&mut self, error: &str) {
        self.record_attempt();
        self.state = JobState::Failed;
        self.failed_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
        self.lock_token = None;
    }

    /// Puts the job back to waiting after a failed attempt and returns the delay.
    pub fn retry(&mut self, error: &str) -> Duration {
        self.record_attempt();
        let delay = self.backoff.delay_for(self.attempts_made);
        self.state = JobState::Waiting;
        self.last_error = Some(error.to_string());
        self.lock_token = None;
        self.available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        delay
    }

    /// Puts a stalled active job back to waiting without consuming an attempt.
    pub fn requeue_stalled(&mut self) {
        self.state = JobState::Waiting;
        self.available_at = Utc::now();
        self.lock_token = None;
    }

    fn record_attempt(&mut self) {
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting to be claimed (possibly delayed by backoff).
    Waiting,
    /// Job is claimed by a worker.
    Active,
    /// Job completed successfully.
    Completed,
    /// Job failed terminally.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Delay policy applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`.
    Exponential {
        delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

impl Backoff {
    /// Returns the delay to apply after the given number of finished attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                delay_ms,
                max_delay_ms,
            } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                let delay = delay_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(delay.min(max_delay_ms))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            delay_ms: 2000,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// How many finished jobs to keep; `None` keeps all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Retention {
    /// Completed jobs to keep.
    #[serde(default)]
    pub keep_completed: Option<usize>,

    /// Failed jobs to keep.
    #[serde(default)]
    pub keep_failed: Option<usize>,
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            max_attempts: 3,
            backoff: Backoff::default(),
            retention: Retention {
                keep_completed: Some(100),
                keep_failed: None,
            },
        }
    }
}

/// Request to add a job to a queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Error context of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Error message.
    pub message: String,
    /// Formatted error source chain, if any.
    pub trace: Option<String>,
}

impl Failure {
    /// Captures the message and source chain of an error.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            trace: if causes.is_empty() {
                None
            } else {
                Some(causes.join("\n"))
            },
        }
    }

    /// Creates a failure with a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_attempts: u32, backoff: Backoff) -> NewJob {
        NewJob {
            queue: "q".to_string(),
            name: "test".to_string(),
            payload: serde_json::json!({"tag": "noop"}),
            options: JobOptions {
                max_attempts,
                backoff,
                ..JobOptions::default()
            },
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            delay_ms: 2000,
            max_delay_ms: 10_000,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(8000));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(10_000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(10_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_for(1), backoff.delay_for(5));
    }

    #[test]
    fn attempts_never_exceed_max() {
        let mut job = Job::from_request(request(2, Backoff::Fixed { delay_ms: 0 }), 1);
        assert!(job.has_retries_left());
        job.retry("first");
        assert!(!job.has_retries_left());
        job.fail("second");
        job.fail("again");
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("again"));
    }

    #[test]
    fn only_the_current_claim_holds_the_job() {
        let mut stored = Job::from_request(request(3, Backoff::default()), 1);
        stored.activate(new_lock_token());
        let first = stored.clone();

        stored.requeue_stalled();
        assert!(!stored.is_claimed_by(&first));

        stored.activate(new_lock_token());
        let second = stored.clone();
        assert!(stored.is_claimed_by(&second));
        assert!(!stored.is_claimed_by(&first));

        stored.complete();
        assert!(!stored.is_claimed_by(&second));
    }

    #[test]
    fn zero_max_attempts_is_clamped_to_one() {
        let job = Job::from_request(request(0, Backoff::default()), 1);
        assert_eq!(job.max_attempts, 1);
        assert!(!job.has_retries_left());
    }

    #[test]
    fn backoff_deserializes_from_tagged_yaml() {
        let backoff: Backoff = serde_yaml::from_str("type: exponential\ndelay_ms: 2000\n").unwrap();
        assert_eq!(
            backoff,
            Backoff::Exponential {
                delay_ms: 2000,
                max_delay_ms: 60_000
            }
        );
    }

    #[test]
    fn failure_captures_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        let failure = Failure::from_error(&err);
        assert_eq!(failure.message, "outer");
        assert_eq!(failure.trace.as_deref(), Some("caused by: inner"));
    }
}
