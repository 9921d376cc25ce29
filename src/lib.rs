//! replpool - Pool of resource-restricted interactive interpreter sessions
//!
//! Facade over the workspace crates plus process-level setup:
//! - `replpool-sandbox`: restricted interpreter spawning
//! - `replpool-core`: session registry and sentinel-framed execution
//! - `telemetry`: tracing subscriber setup
//!
//! ```ignore
//! let registry = replpool::bootstrap()?;
//! let session = registry.create().await?;
//! let output = session.execute("print('hello')").await?;
//! assert_eq!(output.stdout, "hello\n");
//! ```

#![forbid(unsafe_code)]

pub mod telemetry;

use anyhow::{Context, Result};
use tracing::info;

pub use replpool_core::{
    load_config, parse_config, Error, ErrorKind, ExecutionOutput, Session, SessionConfig,
    SessionRegistry, SessionState, SessionSummary,
};
pub use replpool_sandbox::{ResourceLimits, ShellSpawner, SpawnConfig, SpawnedProcess, Spawner};

/// Load `.env` and layered configuration, then build a registry.
pub fn bootstrap() -> Result<SessionRegistry> {
    let _ = dotenvy::dotenv();
    let config = load_config().context("Failed to load session configuration")?;
    info!(
        interpreter = %config.interpreter,
        timeout_ms = config.execute_timeout_ms,
        memory_limit_mb = config.memory_limit_mb,
        "Session registry configured"
    );
    Ok(SessionRegistry::new(config))
}
