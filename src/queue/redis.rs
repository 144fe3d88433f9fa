//! Redis-backed job store.
//!
//! Per queue the store keeps sorted sets for waiting, delayed, active,
//! completed and failed ids, a hash of wait scores used when a job is put
//! back to waiting, and a hash of claim tokens for active jobs. Job records live as JSON under `{prefix}:job:{id}`.
//! The sorted sets are authoritative for claiming; the `state` field of a
//! record mirrors them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use super::job::{new_lock_token, Failure, Job, JobCounts, JobState, NewJob};
use super::store::JobStore;
use crate::error::QueueError;

/// Bits of the wait score reserved for the enqueue sequence.
const SEQ_BITS: u32 = 40;

/// Highest priority value that keeps wait scores exact in an f64.
pub const MAX_PRIORITY: u32 = (1 << (53 - SEQ_BITS)) - 1;

/// Promotes due delayed jobs, then pops the lowest wait score into the active
/// set under the claim token `ARGV[2]`.
const CLAIM_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local score = redis.call('HGET', KEYS[4], id)
  if score then
    redis.call('ZADD', KEYS[1], score, id)
  end
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[1], popped[1])
redis.call('HSET', KEYS[5], popped[1], ARGV[2])
return popped[1]
";

/// Moves ids claimed before the cutoff from the active set back to waiting
/// and drops their claim tokens.
const RECOVER_SCRIPT: &str = r"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[4], id)
  local score = redis.call('HGET', KEYS[3], id)
  if score then
    redis.call('ZADD', KEYS[2], score, id)
  end
end
return stalled
";

/// Moves a claimed job from the active set into `KEYS[4]` if the claim token
/// still matches. Returns 1 on success, 0 if the job is not active and -1 if
/// a newer claim holds it.
const RELEASE_SCRIPT: &str = r"
local owner = redis.call('HGET', KEYS[2], ARGV[1])
if not owner then
  return 0
end
if owner ~= ARGV[2] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
if ARGV[5] == '1' then
  redis.call('HDEL', KEYS[5], ARGV[1])
end
return 1
";

/// Job store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
    prefix: String,
}

struct QueueKeys {
    wait: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    order: String,
    locks: String,
}

/// Score that orders waiting jobs by priority, then enqueue sequence.
fn wait_score(priority: u32, seq: u64) -> f64 {
    let priority = u64::from(priority.min(MAX_PRIORITY));
    ((priority << SEQ_BITS) | (seq & ((1 << SEQ_BITS) - 1))) as f64
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl RedisStore {
    /// Creates a store connected to the specified Redis URL.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: redis_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        let base = format!("{}:{}", self.prefix, queue);
        QueueKeys {
            wait: format!("{}:wait", base),
            delayed: format!("{}:delayed", base),
            active: format!("{}:active", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            order: format!("{}:order", base),
            locks: format!("{}:locks", base),
        }
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Loads a job record or fails with `JobNotFound`.
    async fn load(&self, job_id: &str) -> Result<Job, QueueError> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Updates a job's data in Redis.
    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        let job_json =
            serde_json::to_string(job).map_err(|e| QueueError::SerializationFailed(e.to_string()))?;

        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(self.job_key(&job.id), &job_json)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

        Ok(())
    }

    /// Writes `job` and moves it from the active set into `target` with
    /// `score`, provided `claim` still holds it.
    async fn release(
        &self,
        claim: &Job,
        job: &Job,
        keys: &QueueKeys,
        target: &str,
        score: f64,
        finished: bool,
    ) -> Result<(), QueueError> {
        let job_json =
            serde_json::to_string(job).map_err(|e| QueueError::SerializationFailed(e.to_string()))?;

        let mut conn = self.connection.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&keys.active)
            .key(&keys.locks)
            .key(self.job_key(&job.id))
            .key(target)
            .key(&keys.order)
            .arg(&job.id)
            .arg(claim.lock_token.as_deref().unwrap_or_default())
            .arg(&job_json)
            .arg(score)
            .arg(if finished { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

        match released {
            1 => Ok(()),
            -1 => Err(QueueError::ClaimLost {
                job_id: job.id.clone(),
            }),
            _ => Err(QueueError::NotActive {
                job_id: job.id.clone(),
            }),
        }
    }

    /// Moves a claimed job into a finished set and trims that set to `keep`.
    async fn finish(
        &self,
        claim: &Job,
        job: &Job,
        keys: &QueueKeys,
        finished_key: &str,
        keep: Option<usize>,
    ) -> Result<(), QueueError> {
        self.release(claim, job, keys, finished_key, now_ms() as f64, true)
            .await?;

        if let Some(keep) = keep {
            let mut conn = self.connection.clone();
            let stale: Vec<String> = conn
                .zrange(finished_key, 0, -(keep as isize) - 1)
                .await
                .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

            if !stale.is_empty() {
                let job_keys: Vec<String> = stale.iter().map(|id| self.job_key(id)).collect();
                redis::pipe()
                    .atomic()
                    .zrem(finished_key, &stale)
                    .ignore()
                    .del(&job_keys)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn ids(&self, key: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.connection.clone();
        conn.zrange(key, 0, -1)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, request: NewJob) -> Result<String, QueueError> {
        let mut conn = self.connection.clone();

        let seq: u64 = conn
            .incr(format!("{}:seq", self.prefix), 1)
            .await
            .map_err(|e| QueueError::EnqueueFailed(e.to_string()))?;

        let job = Job::from_request(request, seq);
        let keys = self.keys(&job.queue);
        let score = wait_score(job.priority, job.seq);
        let job_json =
            serde_json::to_string(&job).map_err(|e| QueueError::SerializationFailed(e.to_string()))?;

        redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), &job_json)
            .ignore()
            .hset(&keys.order, &job.id, score)
            .ignore()
            .zadd(&keys.wait, &job.id, score)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::EnqueueFailed(e.to_string()))?;

        Ok(job.id)
    }

    async fn dequeue_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let keys = self.keys(queue);
        let lock_token = new_lock_token();
        let mut conn = self.connection.clone();

        let claimed: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.order)
            .key(&keys.locks)
            .arg(now_ms())
            .arg(&lock_token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        let Some(job_id) = claimed else {
            return Ok(None);
        };

        let mut job = self.load(&job_id).await?;
        job.activate(lock_token);
        self.update_job(&job).await?;

        Ok(Some(job))
    }

    async fn mark_completed(&self, claim: &Job) -> Result<Job, QueueError> {
        let mut job = self.load(&claim.id).await?;
        let keys = self.keys(&job.queue);
        job.complete();
        self.finish(claim, &job, &keys, &keys.completed, job.retention.keep_completed)
            .await?;
        Ok(job)
    }

    async fn mark_failed(&self, claim: &Job, failure: &Failure) -> Result<Job, QueueError> {
        let mut job = self.load(&claim.id).await?;
        let keys = self.keys(&job.queue);
        job.fail(&failure.message);
        self.finish(claim, &job, &keys, &keys.failed, job.retention.keep_failed)
            .await?;
        Ok(job)
    }

    async fn reschedule_with_backoff(
        &self,
        claim: &Job,
        failure: &Failure,
    ) -> Result<Job, QueueError> {
        let mut job = self.load(&claim.id).await?;
        let keys = self.keys(&job.queue);
        if !job.has_retries_left() {
            return Err(QueueError::AttemptsExhausted {
                job_id: job.id.clone(),
                max_attempts: job.max_attempts,
            });
        }

        let delay = job.retry(&failure.message);
        if delay.is_zero() {
            let score = wait_score(job.priority, job.seq);
            self.release(claim, &job, &keys, &keys.wait, score, false)
                .await?;
        } else {
            let score = job.available_at.timestamp_millis() as f64;
            self.release(claim, &job, &keys, &keys.delayed, score, false)
                .await?;
        }

        Ok(job)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.connection.clone();

        let (wait, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(&keys.wait)
                .zcard(&keys.delayed)
                .zcard(&keys.active)
                .zcard(&keys.completed)
                .zcard(&keys.failed)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        Ok(JobCounts {
            waiting: wait + delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection.clone();

        let job_json: Option<String> = conn
            .get(self.job_key(job_id))
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        match job_json {
            Some(json) => {
                let job: Job = serde_json::from_str(&json)
                    .map_err(|e| QueueError::SerializationFailed(e.to_string()))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let keys = self.keys(queue);
        let ids = match state {
            JobState::Waiting => {
                let mut ids = self.ids(&keys.wait).await?;
                ids.extend(self.ids(&keys.delayed).await?);
                ids
            }
            JobState::Active => self.ids(&keys.active).await?,
            JobState::Completed => self.ids(&keys.completed).await?,
            JobState::Failed => self.ids(&keys.failed).await?,
        };

        let mut jobs = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(job) = self.get_job(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        stalled_for: Duration,
    ) -> Result<usize, QueueError> {
        let keys = self.keys(queue);
        let cutoff = now_ms() - stalled_for.as_millis() as i64;
        let mut conn = self.connection.clone();

        let stalled: Vec<String> = redis::Script::new(RECOVER_SCRIPT)
            .key(&keys.active)
            .key(&keys.wait)
            .key(&keys.order)
            .key(&keys.locks)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

        for id in &stalled {
            if let Some(mut job) = self.get_job(id).await? {
                job.requeue_stalled();
                self.update_job(&job).await?;
            }
        }

        Ok(stalled.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_score_orders_by_priority_then_sequence() {
        assert!(wait_score(1, 500) < wait_score(5, 1));
        assert!(wait_score(1, 1) < wait_score(1, 2));
        assert!(wait_score(MAX_PRIORITY, 1) > wait_score(MAX_PRIORITY - 1, (1 << SEQ_BITS) - 1));
    }

    #[test]
    fn wait_score_is_exact_at_the_limits() {
        let score = wait_score(MAX_PRIORITY, (1 << SEQ_BITS) - 1);
        assert_eq!(score as u64, (1u64 << 53) - 1);
        assert_eq!(wait_score(u32::MAX, 7), wait_score(MAX_PRIORITY, 7));
    }
}
