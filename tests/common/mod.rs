//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetflow_mailq::error::NotificationError;
use fleetflow_mailq::lifecycle::{MailQueueService, ServiceCounts, ServiceSettings};
use fleetflow_mailq::notify::{AdminAlerter, Mailer, Metrics};
use fleetflow_mailq::queue::{Backoff, DlqEntry, JobOptions, JobStore, MemoryStore, Retention};
use fleetflow_mailq::worker::PoolConfig;

pub const EMAIL_QUEUE: &str = "fleetflow-email";
pub const DLQ: &str = "fleetflow-email-dlq";

/// Mailer that fails a configurable number of times and records deliveries.
#[derive(Default)]
pub struct FakeMailer {
    failures_left: AtomicU32,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeMailer {
    pub fn reliable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send_password_reset(
        &self,
        email: &str,
        reset_token: &str,
    ) -> Result<(), NotificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(NotificationError::SmtpFailed(
                "421 service not available".to_string(),
            ));
        }

        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), reset_token.to_string()));
        Ok(())
    }
}

/// Alerter that records entries, optionally failing every call.
#[derive(Default)]
pub struct FakeAlerter {
    always_fail: bool,
    calls: AtomicUsize,
    alerts: Mutex<Vec<DlqEntry>>,
}

impl FakeAlerter {
    pub fn reliable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            always_fail: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn alerts(&self) -> Vec<DlqEntry> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdminAlerter for FakeAlerter {
    async fn send_dead_letter_alert(&self, entry: &DlqEntry) -> Result<(), NotificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(NotificationError::DiscordFailed("HTTP 500".to_string()));
        }
        self.alerts.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

fn pool(queue: &str, concurrency: usize) -> PoolConfig {
    let mut config = PoolConfig::new(queue);
    config.concurrency = concurrency;
    config.rate_max = 1000;
    config.poll_interval = Duration::from_millis(5);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Settings with fast polling, immediate retries and `max_attempts` attempts.
pub fn settings(max_attempts: u32, concurrency: usize) -> ServiceSettings {
    ServiceSettings {
        email_queue: EMAIL_QUEUE.to_string(),
        email_options: JobOptions {
            priority: 1,
            max_attempts,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retention: Retention::default(),
        },
        email_pool: pool(EMAIL_QUEUE, concurrency),
        dead_letter_queue: DLQ.to_string(),
        dead_letter_options: JobOptions {
            priority: 1,
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retention: Retention::default(),
        },
        dead_letter_pool: pool(DLQ, 2),
        producer_capacity: 64,
        stats_interval: None,
    }
}

/// Builds a service over a fresh in-memory store.
pub fn service(
    settings: ServiceSettings,
    mailer: Arc<FakeMailer>,
    alerter: Arc<FakeAlerter>,
) -> (MailQueueService, Arc<dyn JobStore>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let service = MailQueueService::new(
        settings,
        Arc::clone(&store),
        mailer,
        alerter,
        Arc::new(Metrics::new().unwrap()),
    );
    (service, store)
}

/// Polls the service counts until `condition` holds, panicking after about two seconds.
pub async fn wait_for_counts<F>(service: &MailQueueService, condition: F) -> ServiceCounts
where
    F: Fn(&ServiceCounts) -> bool,
{
    for _ in 0..400 {
        let counts = service.counts().await.unwrap();
        if condition(&counts) {
            return counts;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue counts did not reach the expected state");
}
