mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleetflow_mailq::error::QueueError;
use fleetflow_mailq::queue::{
    Backoff, EmailPayload, Failure, JobOptions, JobState, JobStore, MemoryStore, NewJob, Retention,
};

fn job(priority: u32, email: &str) -> NewJob {
    NewJob {
        queue: common::EMAIL_QUEUE.to_string(),
        name: "email:forgot_password".to_string(),
        payload: EmailPayload::forgot_password(email, "t").to_value(),
        options: JobOptions {
            priority,
            max_attempts: 3,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retention: Retention::default(),
        },
    }
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    for i in 0..100 {
        store.enqueue(job(1, &format!("user{}@example.com", i))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn lower_priority_number_runs_first_then_fifo() {
    let store = MemoryStore::new();
    let slow = store.enqueue(job(5, "slow@example.com")).await.unwrap();
    let first = store.enqueue(job(1, "first@example.com")).await.unwrap();
    let second = store.enqueue(job(1, "second@example.com")).await.unwrap();

    let order: Vec<String> = [
        store.dequeue_next(common::EMAIL_QUEUE).await.unwrap(),
        store.dequeue_next(common::EMAIL_QUEUE).await.unwrap(),
        store.dequeue_next(common::EMAIL_QUEUE).await.unwrap(),
    ]
    .into_iter()
    .map(|job| job.unwrap().id)
    .collect();

    assert_eq!(order, vec![first, second, slow]);
    assert!(store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().is_none());
}

#[tokio::test]
async fn attempts_accumulate_until_terminal_failure() {
    let store = MemoryStore::new();
    let id = store.enqueue(job(1, "alice@example.com")).await.unwrap();
    let failure = Failure::message("smtp down");

    for attempt in 1..=2 {
        let claim = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();
        assert_eq!(claim.id, id);
        let job = store.reschedule_with_backoff(&claim, &failure).await.unwrap();
        assert_eq!(job.attempts_made, attempt);
        assert_eq!(job.state, JobState::Waiting);
    }

    let claim = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();
    let job = store.mark_failed(&claim, &failure).await.unwrap();
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("smtp down"));

    let counts = store.counts(common::EMAIL_QUEUE).await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.failed), (0, 0, 1));
}

#[tokio::test]
async fn finished_jobs_leave_the_active_set() {
    let store = MemoryStore::new();
    store.enqueue(job(1, "bob@example.com")).await.unwrap();
    let claim = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();

    store.mark_completed(&claim).await.unwrap();
    assert!(store.mark_completed(&claim).await.is_err());

    let counts = store.counts(common::EMAIL_QUEUE).await.unwrap();
    assert_eq!((counts.active, counts.completed), (0, 1));
}

#[tokio::test]
async fn stalled_jobs_return_to_waiting_with_attempts_unchanged() {
    let store = MemoryStore::new();
    let id = store.enqueue(job(1, "carol@example.com")).await.unwrap();
    store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();

    assert_eq!(
        store
            .recover_stalled(common::EMAIL_QUEUE, Duration::from_secs(60))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .recover_stalled(common::EMAIL_QUEUE, Duration::ZERO)
            .await
            .unwrap(),
        1
    );

    let job = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts_made, 0);
}

#[tokio::test]
async fn worker_that_lost_its_claim_cannot_overwrite_the_new_owner() {
    let store = MemoryStore::new();
    store.enqueue(job(1, "erin@example.com")).await.unwrap();

    let stale = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();
    store
        .recover_stalled(common::EMAIL_QUEUE, Duration::ZERO)
        .await
        .unwrap();
    let owner = store.dequeue_next(common::EMAIL_QUEUE).await.unwrap().unwrap();
    assert_eq!(owner.id, stale.id);

    let err = store.mark_completed(&stale).await.unwrap_err();
    assert!(matches!(err, QueueError::ClaimLost { .. }));
    let err = store
        .mark_failed(&stale, &Failure::message("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ClaimLost { .. }));

    let done = store.mark_completed(&owner).await.unwrap();
    assert_eq!(done.state, JobState::Completed);

    let counts = store.counts(common::EMAIL_QUEUE).await.unwrap();
    assert_eq!((counts.active, counts.completed, counts.failed), (0, 1, 0));
}
