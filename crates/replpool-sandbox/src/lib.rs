//! replpool Sandbox - Restricted interpreter spawning
//!
//! This crate starts the long-lived interpreter processes behind each session:
//! - Limits: resource ceilings applied before the interpreter starts
//! - Spawner: the restricted spawn capability consumed by the session layer

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod limits;
pub mod spawner;

pub use error::{Error, Result};
pub use limits::ResourceLimits;
pub use spawner::{ShellSpawner, SpawnConfig, SpawnedProcess, Spawner};
