//! In-process job store.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::job::{new_lock_token, Failure, Job, JobCounts, JobState, NewJob};
use super::store::JobStore;
use crate::error::QueueError;

/// Job store kept in memory; all transitions happen under one lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    jobs: HashMap<String, Job>,
    queues: HashMap<String, QueueIndex>,
}

#[derive(Default)]
struct QueueIndex {
    /// (priority, seq, id)
    waiting: BTreeSet<(u32, u64, String)>,
    /// (available_at, seq, id)
    delayed: BTreeSet<(DateTime<Utc>, u64, String)>,
    /// id -> claim time
    active: HashMap<String, DateTime<Utc>>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl QueueIndex {
    fn promote_due(&mut self, jobs: &HashMap<String, Job>, now: DateTime<Utc>) {
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now {
                break;
            }
            self.delayed.remove(&first);
            if let Some(job) = jobs.get(&first.2) {
                self.waiting.insert((job.priority, job.seq, first.2));
            }
        }
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drops the oldest ids beyond `keep` along with their job records.
fn trim(ids: &mut VecDeque<String>, keep: Option<usize>, jobs: &mut HashMap<String, Job>) {
    if let Some(keep) = keep {
        while ids.len() > keep {
            if let Some(id) = ids.pop_front() {
                jobs.remove(&id);
            }
        }
    }
}

fn not_active(job_id: &str) -> QueueError {
    QueueError::NotActive {
        job_id: job_id.to_string(),
    }
}

/// Checks that `claim` still holds `job`, which must be active.
fn check_claim(index: &QueueIndex, job: &Job, claim: &Job) -> Result<(), QueueError> {
    if !index.active.contains_key(&job.id) {
        return Err(not_active(&job.id));
    }
    if !job.is_claimed_by(claim) {
        return Err(QueueError::ClaimLost {
            job_id: job.id.clone(),
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, request: NewJob) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let job = Job::from_request(request, inner.seq);
        let id = job.id.clone();

        inner
            .queues
            .entry(job.queue.clone())
            .or_default()
            .waiting
            .insert((job.priority, job.seq, id.clone()));
        inner.jobs.insert(id.clone(), job);

        Ok(id)
    }

    async fn dequeue_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { jobs, queues, .. } = &mut *guard;

        let Some(index) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Utc::now();
        index.promote_due(jobs, now);

        let Some((_, _, id)) = index.waiting.pop_first() else {
            return Ok(None);
        };

        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::JobNotFound { job_id: id.clone() })?;
        job.activate(new_lock_token());
        index.active.insert(id, now);

        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, claim: &Job) -> Result<Job, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { jobs, queues, .. } = &mut *guard;

        let job = jobs.get_mut(&claim.id).ok_or_else(|| QueueError::JobNotFound {
            job_id: claim.id.clone(),
        })?;
        let index = queues.get_mut(&job.queue).ok_or_else(|| not_active(&claim.id))?;
        check_claim(index, job, claim)?;

        index.active.remove(&claim.id);
        job.complete();
        let snapshot = job.clone();
        index.completed.push_back(claim.id.clone());
        trim(&mut index.completed, snapshot.retention.keep_completed, jobs);

        Ok(snapshot)
    }

    async fn mark_failed(&self, claim: &Job, failure: &Failure) -> Result<Job, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { jobs, queues, .. } = &mut *guard;

        let job = jobs.get_mut(&claim.id).ok_or_else(|| QueueError::JobNotFound {
            job_id: claim.id.clone(),
        })?;
        let index = queues.get_mut(&job.queue).ok_or_else(|| not_active(&claim.id))?;
        check_claim(index, job, claim)?;

        index.active.remove(&claim.id);
        job.fail(&failure.message);
        let snapshot = job.clone();
        index.failed.push_back(claim.id.clone());
        trim(&mut index.failed, snapshot.retention.keep_failed, jobs);

        Ok(snapshot)
    }

    async fn reschedule_with_backoff(
        &self,
        claim: &Job,
        failure: &Failure,
    ) -> Result<Job, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { jobs, queues, .. } = &mut *guard;

        let job = jobs.get_mut(&claim.id).ok_or_else(|| QueueError::JobNotFound {
            job_id: claim.id.clone(),
        })?;
        let index = queues.get_mut(&job.queue).ok_or_else(|| not_active(&claim.id))?;
        check_claim(index, job, claim)?;
        if !job.has_retries_left() {
            return Err(QueueError::AttemptsExhausted {
                job_id: claim.id.clone(),
                max_attempts: job.max_attempts,
            });
        }

        index.active.remove(&claim.id);
        let delay = job.retry(&failure.message);
        if delay.is_zero() {
            index
                .waiting
                .insert((job.priority, job.seq, claim.id.clone()));
        } else {
            index
                .delayed
                .insert((job.available_at, job.seq, claim.id.clone()));
        }

        Ok(job.clone())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(queue)
            .map(|index| JobCounts {
                waiting: index.waiting.len() + index.delayed.len(),
                active: index.active.len(),
                completed: index.completed.len(),
                failed: index.failed.len(),
            })
            .unwrap_or_default())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let inner = self.inner.lock().await;
        let Some(index) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let ids: Vec<&String> = match state {
            JobState::Waiting => index
                .waiting
                .iter()
                .map(|(_, _, id)| id)
                .chain(index.delayed.iter().map(|(_, _, id)| id))
                .collect(),
            JobState::Active => {
                let mut active: Vec<_> = index.active.iter().collect();
                active.sort_by_key(|(_, claimed_at)| **claimed_at);
                active.into_iter().map(|(id, _)| id).collect()
            }
            JobState::Completed => index.completed.iter().collect(),
            JobState::Failed => index.failed.iter().collect(),
        };

        Ok(ids
            .into_iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        stalled_for: Duration,
    ) -> Result<usize, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { jobs, queues, .. } = &mut *guard;

        let Some(index) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(stalled_for).unwrap_or_else(|_| chrono::Duration::zero());
        let stalled: Vec<String> = index
            .active
            .iter()
            .filter(|(_, claimed_at)| **claimed_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stalled {
            index.active.remove(id);
            if let Some(job) = jobs.get_mut(id) {
                job.requeue_stalled();
                index.waiting.insert((job.priority, job.seq, id.clone()));
            }
        }

        Ok(stalled.len())
    }
}
