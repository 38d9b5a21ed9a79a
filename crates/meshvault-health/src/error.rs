//! Health monitor error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Health monitor is already running")]
    AlreadyRunning,

    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
