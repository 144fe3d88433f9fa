//! Start and stop of the mail queue service.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::QueueError;
use crate::notify::{AdminAlerter, Mailer, Metrics};
use crate::queue::{EnqueueForwarder, JobCounts, JobOptions, JobStore, MailProducer, NewJob};
use crate::worker::{DeadLetterProcessor, EmailProcessor, PoolConfig, WorkerPool};

/// Everything the service needs to know about its two queues.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub email_queue: String,
    pub email_options: JobOptions,
    pub email_pool: PoolConfig,
    pub dead_letter_queue: String,
    pub dead_letter_options: JobOptions,
    pub dead_letter_pool: PoolConfig,
    /// Capacity of the producer channel.
    pub producer_capacity: usize,
    /// Interval of the queue stats log; `None` disables it.
    pub stats_interval: Option<Duration>,
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            email_queue: config.queues.email.name.clone(),
            email_options: config.queues.email.job_options(),
            email_pool: config.email_pool(),
            dead_letter_queue: config.queues.dead_letter.name.clone(),
            dead_letter_options: config.queues.dead_letter.job_options(),
            dead_letter_pool: config.dead_letter_pool(),
            producer_capacity: config.queues.email.producer_capacity,
            stats_interval: config.worker.stats_interval_secs.map(Duration::from_secs),
        }
    }
}

/// Job counts of both queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceCounts {
    pub email: JobCounts,
    pub dead_letter: JobCounts,
}

struct Running {
    shutdown: watch::Sender<bool>,
    forwarder: JoinHandle<mpsc::Receiver<NewJob>>,
    pools: Vec<(String, JoinHandle<()>)>,
    stats: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    receiver: Option<mpsc::Receiver<NewJob>>,
    running: Option<Running>,
}

/// Owns the producer channel, the enqueue forwarder and both worker pools.
pub struct MailQueueService {
    settings: ServiceSettings,
    store: Arc<dyn JobStore>,
    mailer: Arc<dyn Mailer>,
    alerter: Arc<dyn AdminAlerter>,
    metrics: Arc<Metrics>,
    producer: MailProducer,
    state: Mutex<State>,
}

impl MailQueueService {
    pub fn new(
        settings: ServiceSettings,
        store: Arc<dyn JobStore>,
        mailer: Arc<dyn Mailer>,
        alerter: Arc<dyn AdminAlerter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (producer, receiver) = MailProducer::channel(
            &settings.email_queue,
            settings.email_options,
            settings.producer_capacity,
        );

        Self {
            settings,
            store,
            mailer,
            alerter,
            metrics,
            producer,
            state: Mutex::new(State {
                receiver: Some(receiver),
                running: None,
            }),
        }
    }

    /// Returns a fire-and-forget producer for the email queue.
    ///
    /// Jobs sent while the service is stopped stay buffered until the next start.
    pub fn producer(&self) -> MailProducer {
        self.producer.clone()
    }

    /// Returns the job store shared by both queues.
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    /// Starts the forwarder and both worker pools. Calling it while running does nothing.
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            debug!("Mail queue service already running");
            return Ok(());
        }
        let receiver = state.receiver.take().ok_or(QueueError::ProducerClosed)?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        let forwarder = EnqueueForwarder::new(receiver, self.store(), Arc::clone(&self.metrics));
        let forwarder = tokio::spawn(forwarder.run(shutdown_rx.clone()));

        let email_processor = EmailProcessor::new(
            Arc::clone(&self.mailer),
            self.store(),
            self.settings.dead_letter_queue.clone(),
            self.settings.dead_letter_options,
            Arc::clone(&self.metrics),
        );
        let email_pool = WorkerPool::new(
            self.store(),
            Arc::new(email_processor),
            self.settings.email_pool.clone(),
            Arc::clone(&self.metrics),
        );

        let dead_letter_pool = WorkerPool::new(
            self.store(),
            Arc::new(DeadLetterProcessor::new(Arc::clone(&self.alerter))),
            self.settings.dead_letter_pool.clone(),
            Arc::clone(&self.metrics),
        );

        let pools = vec![
            (
                self.settings.email_pool.queue.clone(),
                tokio::spawn(email_pool.run(shutdown_rx.clone())),
            ),
            (
                self.settings.dead_letter_pool.queue.clone(),
                tokio::spawn(dead_letter_pool.run(shutdown_rx.clone())),
            ),
        ];

        let stats = self.settings.stats_interval.map(|interval| {
            tokio::spawn(stats_loop(
                self.store(),
                Arc::clone(&self.metrics),
                self.settings.email_queue.clone(),
                self.settings.dead_letter_queue.clone(),
                interval,
                shutdown_rx,
            ))
        });

        state.running = Some(Running {
            shutdown,
            forwarder,
            pools,
            stats,
        });

        info!(
            email_queue = %self.settings.email_queue,
            dead_letter_queue = %self.settings.dead_letter_queue,
            "Mail queue service started"
        );
        Ok(())
    }

    /// Stops accepting new claims and waits for in-flight jobs, bounded by each
    /// pool's shutdown timeout. The service may be started again afterwards.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            debug!("Mail queue service not running");
            return;
        };

        info!("Stopping mail queue service");
        let _ = running.shutdown.send(true);

        match running.forwarder.await {
            Ok(receiver) => state.receiver = Some(receiver),
            Err(e) => error!(error = %e, "Enqueue forwarder task failed, producer is closed"),
        }

        for (queue, handle) in running.pools {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "Worker pool task failed");
            }
        }

        if let Some(stats) = running.stats {
            let _ = stats.await;
        }

        info!("Mail queue service stopped");
    }

    /// Returns the job counts of both queues.
    pub async fn counts(&self) -> Result<ServiceCounts, QueueError> {
        Ok(ServiceCounts {
            email: self.store.counts(&self.settings.email_queue).await?,
            dead_letter: self.store.counts(&self.settings.dead_letter_queue).await?,
        })
    }
}

async fn stats_loop(
    store: Arc<dyn JobStore>,
    metrics: Arc<Metrics>,
    email_queue: String,
    dead_letter_queue: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                for queue in [&email_queue, &dead_letter_queue] {
                    match store.counts(queue).await {
                        Ok(counts) => {
                            metrics.set_queue_depth(queue, &counts);
                            info!(
                                queue = %queue,
                                waiting = counts.waiting,
                                active = counts.active,
                                completed = counts.completed,
                                failed = counts.failed,
                                "Queue stats"
                            );
                            if queue == &dead_letter_queue && counts.waiting > 0 {
                                warn!(
                                    queue = %queue,
                                    waiting = counts.waiting,
                                    "Failed emails awaiting admin review"
                                );
                            }
                        }
                        Err(e) => warn!(queue = %queue, error = %e, "Failed to read queue stats"),
                    }
                }
            }
        }
    }
}
