//! Infrastructure layer: configuration, logging, retries and backend selection.

pub mod config;
pub mod logging;
pub mod retry;
pub mod storage;

pub use config::{ConfigError, ConfigLoader};
pub use logging::LoggerImpl;
pub use retry::RetryPolicy;
pub use storage::{create_storage, get_storage, install_storage, setup_storage, BackendRegistry};
