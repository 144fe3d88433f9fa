//! Job storage and the email / dead-letter queues built on it.

pub mod job;
pub mod memory;
pub mod payload;
pub mod producer;
pub mod redis;
pub mod store;

pub use job::{Backoff, Failure, Job, JobCounts, JobOptions, JobState, NewJob, Retention};
pub use memory::MemoryStore;
pub use payload::{DlqEntry, EmailPayload};
pub use producer::{add_password_reset_email, add_to_dlq, EnqueueForwarder, MailProducer};
pub use redis::RedisStore;
pub use store::JobStore;
