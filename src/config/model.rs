//! Configuration data structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{Backoff, JobOptions, Retention};
use crate::worker::PoolConfig;

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which job store backs the queues.
    #[serde(default)]
    pub store: StoreBackend,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue and pool settings.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Settings shared by both worker pools.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Outbound mail settings.
    #[serde(default)]
    pub mail: MailConfig,

    /// Admin alert settings.
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Job store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis store.
    #[default]
    Redis,
    /// In-process store; jobs are lost on exit.
    Memory,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; takes precedence over the other fields.
    #[serde(default)]
    pub url: Option<String>,

    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,

    /// Prefix of every key written by the store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    /// Builds the Redis URL from configuration.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Settings of both queues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Outbound email queue.
    #[serde(default)]
    pub email: EmailQueueConfig,

    /// Dead-letter queue.
    #[serde(default)]
    pub dead_letter: DeadLetterQueueConfig,
}

/// Start rate limit of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum job starts per window.
    #[serde(default = "default_rate_max")]
    pub max: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_rate_duration_ms")]
    pub duration_ms: u64,
}

/// Email queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailQueueConfig {
    /// Queue name.
    #[serde(default = "default_email_queue_name")]
    pub name: String,

    /// Maximum emails in flight.
    #[serde(default = "default_email_concurrency")]
    pub concurrency: usize,

    /// Start rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Attempts per email (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay policy between attempts.
    #[serde(default)]
    pub backoff: Backoff,

    /// Priority of password reset jobs.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Completed jobs to keep.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: Option<usize>,

    /// Failed jobs to keep; unset keeps all of them.
    #[serde(default)]
    pub keep_failed: Option<usize>,

    /// Capacity of the fire-and-forget producer channel.
    #[serde(default = "default_producer_capacity")]
    pub producer_capacity: usize,
}

impl EmailQueueConfig {
    /// Options applied to every email job.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.priority,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            retention: Retention {
                keep_completed: self.keep_completed,
                keep_failed: self.keep_failed,
            },
        }
    }
}

/// Dead-letter queue configuration. DLQ jobs always run exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterQueueConfig {
    /// Queue name.
    #[serde(default = "default_dlq_name")]
    pub name: String,

    /// Maximum alerts in flight.
    #[serde(default = "default_dlq_concurrency")]
    pub concurrency: usize,

    /// Start rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Priority of DLQ entries.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Completed entries to keep.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: Option<usize>,

    /// Failed entries to keep.
    #[serde(default = "default_dlq_keep_failed")]
    pub keep_failed: Option<usize>,
}

impl DeadLetterQueueConfig {
    /// Options applied to every DLQ entry.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.priority,
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retention: Retention {
                keep_completed: self.keep_completed,
                keep_failed: self.keep_failed,
            },
        }
    }
}

/// Settings shared by both worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pause between claims when a queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Limit on a single attempt; unset waits forever.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: Option<u64>,

    /// Age after which an active job is considered abandoned and requeued.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// How long shutdown waits for in-flight jobs.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Interval of the periodic queue stats log; unset disables it.
    #[serde(default)]
    pub stats_interval_secs: Option<u64>,
}

impl WorkerConfig {
    fn pool_config(&self, queue: &str, concurrency: usize, rate: RateLimitConfig) -> PoolConfig {
        PoolConfig {
            queue: queue.to_string(),
            concurrency,
            rate_max: rate.max,
            rate_window: Duration::from_millis(rate.duration_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Pool settings of the email queue.
    pub fn email_pool(&self) -> PoolConfig {
        let queue = &self.queues.email;
        self.worker
            .pool_config(&queue.name, queue.concurrency, queue.rate_limit)
    }

    /// Pool settings of the dead-letter queue.
    pub fn dead_letter_pool(&self) -> PoolConfig {
        let queue = &self.queues.dead_letter;
        self.worker
            .pool_config(&queue.name, queue.concurrency, queue.rate_limit)
    }
}

/// Outbound mail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// SMTP relay; unset means mail is only logged.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,

    /// Base URL of the frontend, used to build reset links.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    /// Recipient of dead-letter alert emails.
    #[serde(default)]
    pub admin_email: Option<String>,
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server host.
    pub host: String,

    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// SMTP username.
    #[serde(default)]
    pub username: Option<String>,

    /// SMTP password.
    #[serde(default)]
    pub password: Option<String>,

    /// Sender address.
    pub from_email: String,

    /// Sender display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,

    /// Whether to use TLS (false for local dev servers).
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

/// Admin alert configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Discord webhook settings.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

/// Discord webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Discord webhook URL.
    pub webhook_url: String,

    /// Optional user ID to mention on alerts.
    #[serde(default)]
    pub mention_on_failure: Option<String>,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to enable Prometheus metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the Prometheus metrics HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

// Default value functions

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "fleetflow".to_string()
}

fn default_rate_max() -> u32 {
    100
}

fn default_rate_duration_ms() -> u64 {
    2000
}

fn default_email_queue_name() -> String {
    "fleetflow-email".to_string()
}

fn default_email_concurrency() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_priority() -> u32 {
    1
}

fn default_keep_completed() -> Option<usize> {
    Some(100)
}

fn default_producer_capacity() -> usize {
    1024
}

fn default_dlq_name() -> String {
    "fleetflow-email-dlq".to_string()
}

fn default_dlq_concurrency() -> usize {
    20
}

fn default_dlq_keep_failed() -> Option<usize> {
    Some(50)
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_job_timeout_secs() -> Option<u64> {
    Some(30)
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "FleetFlow".to_string()
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_max(),
            duration_ms: default_rate_duration_ms(),
        }
    }
}

impl Default for EmailQueueConfig {
    fn default() -> Self {
        Self {
            name: default_email_queue_name(),
            concurrency: default_email_concurrency(),
            rate_limit: RateLimitConfig::default(),
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            priority: default_priority(),
            keep_completed: default_keep_completed(),
            keep_failed: None,
            producer_capacity: default_producer_capacity(),
        }
    }
}

impl Default for DeadLetterQueueConfig {
    fn default() -> Self {
        Self {
            name: default_dlq_name(),
            concurrency: default_dlq_concurrency(),
            rate_limit: RateLimitConfig::default(),
            priority: default_priority(),
            keep_completed: default_keep_completed(),
            keep_failed: default_dlq_keep_failed(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stats_interval_secs: None,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp: None,
            frontend_url: default_frontend_url(),
            admin_email: None,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_prometheus_port(),
        }
    }
}
