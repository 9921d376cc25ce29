//! Error types for replpool-sandbox

use thiserror::Error;

/// Spawn error type
#[derive(Debug, Error)]
pub enum Error {
    /// The shell or interpreter could not be started
    #[error("failed to spawn interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    /// A standard stream was not captured after spawning
    #[error("failed to acquire {0} pipe")]
    MissingPipe(&'static str),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
