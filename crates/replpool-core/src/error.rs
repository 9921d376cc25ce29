//! Error types for replpool-core
//!
//! Only transport-level faults are errors. Exceptions raised by submitted code
//! come back as ordinary diagnostic text.

use thiserror::Error;

/// Coarse classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Spawn, pipe or stream fault
    System,
    /// Deadline elapsed before the reply was complete
    Timeout,
    /// Invalid or unreadable configuration
    Config,
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Restricted spawn failed
    #[error("spawn error: {0}")]
    Spawn(#[from] replpool_sandbox::Error),

    /// Reading or writing an interpreter stream failed
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted
        context: &'static str,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// An interpreter stream reached end of file
    #[error("interpreter closed its {0} stream")]
    StreamClosed(&'static str),

    /// The session has been closed
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// The registry no longer accepts sessions
    #[error("session registry is shutting down")]
    ShuttingDown,

    /// Execution was cancelled from outside
    #[error("execution cancelled")]
    Cancelled,

    /// Deadline elapsed before the sentinel was observed
    #[error("execution timeout after {0}ms")]
    ExecutionTimeout(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExecutionTimeout(_) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            _ => ErrorKind::System,
        }
    }

    /// Whether this is an execution timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub(crate) fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
