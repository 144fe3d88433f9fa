//! Error types for the mail queue.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Invalid value for environment variable {var}: {message}")]
    InvalidEnv { var: String, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Job store and producer errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to Redis at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Failed to enqueue job: {0}")]
    EnqueueFailed(String),

    #[error("Failed to dequeue job: {0}")]
    DequeueFailed(String),

    #[error("Failed to update job: {0}")]
    UpdateFailed(String),

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is not active")]
    NotActive { job_id: String },

    #[error("Job {job_id} is held by a newer claim")]
    ClaimLost { job_id: String },

    #[error("Job {job_id} has no attempts left ({max_attempts} allowed)")]
    AttemptsExhausted { job_id: String, max_attempts: u32 },

    #[error("Failed to serialize job: {0}")]
    SerializationFailed(String),

    #[error("Producer channel is closed")]
    ProducerClosed,

    #[error("Producer channel is full")]
    ProducerFull,
}

/// Collaborator (mail, alert, metrics) errors.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Invalid email address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    #[error("SMTP delivery failed: {0}")]
    SmtpFailed(String),

    #[error("Invalid link '{url}': {message}")]
    InvalidLink { url: String, message: String },

    #[error("No admin recipient configured for alerts")]
    NoAdminRecipient,

    #[error("Discord webhook failed: {0}")]
    DiscordFailed(String),

    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),

    #[error("HTTP request failed: {0}")]
    HttpFailed(#[from] reqwest::Error),
}

/// Failure of a single job attempt.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Unknown job payload: {0}")]
    UnknownPayload(String),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] NotificationError),

    #[error("Job timed out after {millis} ms")]
    Timeout { millis: u64 },
}
