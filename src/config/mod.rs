//! Configuration loading and validation.

pub mod loader;
pub mod model;

pub use loader::{apply_env_overrides, load_and_validate, load_or_default};
pub use model::{AppConfig, StoreBackend};
