//! Generic worker pool that drains one queue of the job store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::rate_limit::RateLimiter;
use crate::error::{JobError, QueueError};
use crate::notify::prometheus::Metrics;
use crate::queue::{Failure, Job, JobStore};

/// Longest pause between claim attempts while the store is failing.
const MAX_STORE_BACKOFF_SECS: u64 = 30;

/// Executes the jobs of one queue.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Processor name for logging.
    fn name(&self) -> &'static str;

    /// Runs one attempt of a claimed job.
    async fn process(&self, job: &Job) -> Result<(), JobError>;

    /// Called exactly once after a job's final attempt fails.
    ///
    /// The default logs the failure and does nothing else.
    async fn on_exhausted(&self, job: &Job, failure: &Failure) {
        warn!(
            job_id = %job.id,
            queue = %job.queue,
            attempts = job.attempts_made,
            error = %failure.message,
            "Job failed terminally, not escalated"
        );
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The attempt succeeded.
    Success,
    /// The attempt failed and the job will run again after `delay`.
    Retry { failure: Failure, delay: Duration },
    /// The final attempt failed.
    Escalate { failure: Failure },
}

impl ProcessOutcome {
    /// Decides the outcome of an attempt on `job`, before the store records it.
    pub fn classify(job: &Job, result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => {
                let failure = Failure::from_error(&e);
                if job.has_retries_left() {
                    Self::Retry {
                        delay: job.backoff.delay_for(job.attempts_made + 1),
                        failure,
                    }
                } else {
                    Self::Escalate { failure }
                }
            }
        }
    }
}

/// Tuning of one worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Queue the pool consumes.
    pub queue: String,
    /// Maximum jobs in flight.
    pub concurrency: usize,
    /// Maximum job starts per `rate_window`.
    pub rate_max: u32,
    /// Window of the start rate limit.
    pub rate_window: Duration,
    /// Pause between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Limit on a single attempt; `None` waits forever.
    pub job_timeout: Option<Duration>,
    /// Age after which an active job counts as abandoned.
    pub stall_timeout: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    /// Creates a config with default tuning for `queue`.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            concurrency: 5,
            rate_max: 10,
            rate_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            job_timeout: Some(Duration::from_secs(30)),
            stall_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts processed jobs and logs a line per batch (size or window reached).
struct BatchTracker {
    size: u32,
    window: Duration,
    state: Mutex<(u32, Instant)>,
}

impl BatchTracker {
    fn new(size: u32, window: Duration) -> Self {
        Self {
            size: size.max(1),
            window,
            state: Mutex::new((0, Instant::now())),
        }
    }

    async fn record(&self, queue: &str) {
        let mut state = self.state.lock().await;
        state.0 += 1;
        let elapsed = state.1.elapsed();
        debug!(queue, processed = state.0, batch_size = self.size, "Batch progress");

        if state.0 >= self.size || elapsed >= self.window {
            info!(
                queue,
                jobs = state.0,
                elapsed_ms = elapsed.as_millis() as u64,
                "Batch complete"
            );
            *state = (0, Instant::now());
        }
    }
}

/// Shared pieces needed to run one job, cloned into each task.
struct JobContext<P> {
    store: Arc<dyn JobStore>,
    processor: Arc<P>,
    metrics: Arc<Metrics>,
    batch: Arc<BatchTracker>,
    job_timeout: Option<Duration>,
}

impl<P> Clone for JobContext<P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            processor: Arc::clone(&self.processor),
            metrics: Arc::clone(&self.metrics),
            batch: Arc::clone(&self.batch),
            job_timeout: self.job_timeout,
        }
    }
}

impl<P: JobProcessor> JobContext<P> {
    /// Runs one attempt and records its outcome in the store.
    async fn execute(&self, job: Job) -> ProcessOutcome {
        info!(
            job_id = %job.id,
            queue = %job.queue,
            name = %job.name,
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        self.metrics.job_started(&job.queue);
        let started = Instant::now();

        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.processor.process(&job)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout {
                    millis: limit.as_millis() as u64,
                }),
            },
            None => self.processor.process(&job).await,
        };

        self.metrics.job_finished(&job.queue, started.elapsed());

        let outcome = ProcessOutcome::classify(&job, result);
        self.apply(&job, &outcome).await;
        self.batch.record(&job.queue).await;
        outcome
    }

    async fn apply(&self, job: &Job, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Success => match self.store.mark_completed(job).await {
                Ok(done) => {
                    self.metrics.record_outcome(&job.queue, "completed");
                    info!(job_id = %job.id, attempts = done.attempts_made, "Job completed");
                }
                Err(e) => record_failed(job, "complete", &e),
            },
            ProcessOutcome::Retry { failure, delay } => {
                match self.store.reschedule_with_backoff(job, failure).await {
                    Ok(rescheduled) => {
                        self.metrics.record_outcome(&job.queue, "retried");
                        warn!(
                            job_id = %job.id,
                            attempt = rescheduled.attempts_made,
                            max_attempts = rescheduled.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message,
                            "Job failed, retry scheduled"
                        );
                    }
                    Err(e) => record_failed(job, "reschedule", &e),
                }
            }
            ProcessOutcome::Escalate { failure } => {
                match self.store.mark_failed(job, failure).await {
                    Ok(failed) => {
                        self.metrics.record_outcome(&job.queue, "failed");
                        error!(
                            job_id = %job.id,
                            attempts = failed.attempts_made,
                            error = %failure.message,
                            "Job failed permanently"
                        );
                        self.processor.on_exhausted(&failed, failure).await;
                    }
                    Err(e) => record_failed(job, "fail", &e),
                }
            }
        }
    }
}

/// Pool of concurrent workers over one queue.
pub struct WorkerPool<P: JobProcessor> {
    config: PoolConfig,
    context: JobContext<P>,
    limiter: RateLimiter,
    semaphore: Arc<Semaphore>,
}

impl<P: JobProcessor> WorkerPool<P> {
    /// Creates a pool; nothing runs until [`run`](Self::run).
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<P>,
        config: PoolConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            limiter: RateLimiter::new(config.rate_max, config.rate_window),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            context: JobContext {
                store,
                processor,
                metrics,
                batch: Arc::new(BatchTracker::new(config.rate_max, config.rate_window)),
                job_timeout: config.job_timeout,
            },
            config,
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Claims and processes a single job inline.
    ///
    /// Returns `None` when no job was available.
    pub async fn process_one(&self) -> Result<Option<ProcessOutcome>, QueueError> {
        match self.context.store.dequeue_next(&self.config.queue).await? {
            Some(job) => Ok(Some(self.context.execute(job).await)),
            None => Ok(None),
        }
    }

    /// Runs the pool until `shutdown` flips to true, then waits for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.queue.clone();
        info!(
            queue = %queue,
            processor = self.context.processor.name(),
            concurrency = self.config.concurrency,
            rate_max = self.config.rate_max,
            rate_window_ms = self.config.rate_window.as_millis() as u64,
            "Starting worker pool"
        );

        self.recover_stalled().await;
        let mut last_stall_check = Instant::now();

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit: OwnedSemaphorePermit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(&queue, joined);
                    continue;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let start = tokio::select! {
                _ = shutdown.changed() => continue,
                start = self.limiter.acquire() => start,
            };

            if last_stall_check.elapsed() >= self.config.stall_timeout {
                self.recover_stalled().await;
                last_stall_check = Instant::now();
            }

            match self.context.store.dequeue_next(&queue).await {
                Ok(Some(job)) => {
                    if consecutive_errors > 0 {
                        info!(queue = %queue, consecutive_errors, "Job store recovered");
                        consecutive_errors = 0;
                    }

                    let context = self.context.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        context.execute(job).await;
                    });
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.limiter.refund(start).await;
                    drop(permit);

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    self.limiter.refund(start).await;
                    drop(permit);

                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(6) - 1), MAX_STORE_BACKOFF_SECS);
                    error!(
                        queue = %queue,
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Failed to claim job, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                }
            }
        }

        info!(queue = %queue, in_flight = tasks.len(), "Worker pool stopping, waiting for in-flight jobs");

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                log_join(&queue, joined);
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                queue = %queue,
                abandoned = tasks.len(),
                "Shutdown timeout reached, abandoning in-flight jobs"
            );
            tasks.abort_all();
        }

        info!(queue = %queue, "Worker pool stopped");
    }

    async fn recover_stalled(&self) {
        match self
            .context
            .store
            .recover_stalled(&self.config.queue, self.config.stall_timeout)
            .await
        {
            Ok(0) => {}
            Ok(count) => warn!(queue = %self.config.queue, count, "Requeued stalled jobs"),
            Err(e) => error!(queue = %self.config.queue, error = %e, "Failed to recover stalled jobs"),
        }
    }
}

/// Logs an outcome the store refused to record.
fn record_failed(job: &Job, action: &'static str, e: &QueueError) {
    match e {
        QueueError::ClaimLost { .. } => warn!(
            job_id = %job.id,
            action,
            "Job was reclaimed after stalling, attempt result discarded"
        ),
        _ => error!(job_id = %job.id, action, error = %e, "Failed to record job outcome"),
    }
}

fn log_join(queue: &str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(queue, error = %e, "Job task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use crate::queue::{Backoff, JobOptions, MemoryStore, NewJob};

    fn job(attempts_made: u32, max_attempts: u32) -> Job {
        let mut job = Job::from_request(
            NewJob {
                queue: "q".to_string(),
                name: "test".to_string(),
                payload: serde_json::json!({}),
                options: JobOptions {
                    max_attempts,
                    backoff: Backoff::Exponential {
                        delay_ms: 2000,
                        max_delay_ms: 60_000,
                    },
                    ..JobOptions::default()
                },
            },
            1,
        );
        job.attempts_made = attempts_made;
        job
    }

    fn failed() -> Result<(), JobError> {
        Err(JobError::Delivery(NotificationError::SmtpFailed(
            "connection refused".to_string(),
        )))
    }

    #[test]
    fn classify_success() {
        assert_eq!(ProcessOutcome::classify(&job(0, 3), Ok(())), ProcessOutcome::Success);
    }

    #[test]
    fn classify_retries_with_exponential_delay() {
        match ProcessOutcome::classify(&job(1, 3), failed()) {
            ProcessOutcome::Retry { failure, delay } => {
                assert_eq!(delay, Duration::from_millis(4000));
                assert!(failure.message.contains("connection refused"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn classify_escalates_on_last_attempt() {
        assert!(matches!(
            ProcessOutcome::classify(&job(2, 3), failed()),
            ProcessOutcome::Escalate { .. }
        ));
        assert!(matches!(
            ProcessOutcome::classify(&job(0, 1), failed()),
            ProcessOutcome::Escalate { .. }
        ));
    }

    struct Sleepy;

    #[async_trait]
    impl JobProcessor for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn process(&self, _job: &Job) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_failure() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        store
            .enqueue(NewJob {
                queue: "q".to_string(),
                name: "test".to_string(),
                payload: serde_json::json!({}),
                options: JobOptions {
                    max_attempts: 1,
                    ..JobOptions::default()
                },
            })
            .await
            .unwrap();

        let mut config = PoolConfig::new("q");
        config.job_timeout = Some(Duration::from_secs(5));
        let pool = WorkerPool::new(
            store.clone(),
            Arc::new(Sleepy),
            config,
            Arc::new(Metrics::new().unwrap()),
        );

        match pool.process_one().await.unwrap() {
            Some(ProcessOutcome::Escalate { failure }) => {
                assert!(failure.message.contains("timed out after 5000 ms"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.counts("q").await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_timeout_reports_milliseconds() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        store
            .enqueue(NewJob {
                queue: "q".to_string(),
                name: "test".to_string(),
                payload: serde_json::json!({}),
                options: JobOptions {
                    max_attempts: 1,
                    ..JobOptions::default()
                },
            })
            .await
            .unwrap();

        let mut config = PoolConfig::new("q");
        config.job_timeout = Some(Duration::from_millis(250));
        let pool = WorkerPool::new(
            store,
            Arc::new(Sleepy),
            config,
            Arc::new(Metrics::new().unwrap()),
        );

        match pool.process_one().await.unwrap() {
            Some(ProcessOutcome::Escalate { failure }) => {
                assert!(failure.message.contains("timed out after 250 ms"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    /// Records the instant of every attempt.
    #[derive(Default)]
    struct Recorder {
        starts: std::sync::Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl JobProcessor for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn process(&self, _job: &Job) -> Result<(), JobError> {
            self.starts.lock().unwrap().push(Instant::now());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pool_starts_at_most_rate_max_jobs_per_window() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        for _ in 0..6 {
            store
                .enqueue(NewJob {
                    queue: "q".to_string(),
                    name: "test".to_string(),
                    payload: serde_json::json!({}),
                    options: JobOptions::default(),
                })
                .await
                .unwrap();
        }

        let mut config = PoolConfig::new("q");
        config.concurrency = 10;
        config.rate_max = 2;
        config.rate_window = Duration::from_secs(1);
        config.poll_interval = Duration::from_millis(10);

        let recorder = Arc::new(Recorder::default());
        let origin = Instant::now();
        let pool = WorkerPool::new(
            store.clone(),
            recorder.clone(),
            config,
            Arc::new(Metrics::new().unwrap()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(pool.run(shutdown_rx));

        while store.counts("q").await.unwrap().completed < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let starts = recorder.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 6);
        let mut per_window = std::collections::HashMap::new();
        for start in &starts {
            let window = start.duration_since(origin).as_secs();
            *per_window.entry(window).or_insert(0) += 1;
        }
        assert!(per_window.values().all(|&n| n <= 2), "starts per window: {:?}", per_window);
        assert!(starts.iter().max().unwrap().duration_since(origin) >= Duration::from_secs(2));
    }
}
