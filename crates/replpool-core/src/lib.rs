//! replpool Core - Session registry and execution protocol
//!
//! This crate keeps a pool of long-lived interpreter sessions:
//! - Registry: session creation, lookup and teardown
//! - Session: per-session serialised execution with a deadline
//! - Protocol: sentinel framing over unframed interpreter streams
//! - Config: layered configuration (defaults, files, environment)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;

pub use crate::config::{load_config, parse_config, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use protocol::Sentinel;
pub use registry::SessionRegistry;
pub use session::{ExecutionOutput, Session, SessionState, SessionSummary};
