//! Worker pools draining the email and dead-letter queues.

pub mod dead_letter;
pub mod email;
pub mod pool;
pub mod rate_limit;

pub use dead_letter::DeadLetterProcessor;
pub use email::EmailProcessor;
pub use pool::{JobProcessor, PoolConfig, ProcessOutcome, WorkerPool};
pub use rate_limit::{RateLimiter, StartToken};
