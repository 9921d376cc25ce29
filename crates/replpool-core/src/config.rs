//! Session configuration
//!
//! Loaded from embedded defaults, optional files and `REPLPOOL_*` environment
//! variables, highest priority last.

use crate::error::{Error, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use replpool_sandbox::{ResourceLimits, SpawnConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Largest accepted memory ceiling (1 TiB)
pub const MAX_MEMORY_LIMIT_MB: u64 = 1024 * 1024;

/// Largest accepted session lifetime (100 years)
pub const MAX_SESSION_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Configuration shared by the registry and its sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for a single `execute` call, in milliseconds
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,
    /// Advisory session lifetime, in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Virtual memory ceiling per interpreter, in MiB
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Read buffer size for the interpreter streams
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// Shell that applies the resource limits
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Interpreter executable
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Interpreter arguments
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
}

fn default_execute_timeout_ms() -> u64 {
    2000
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_memory_limit_mb() -> u64 {
    100
}

fn default_read_chunk_bytes() -> usize {
    1024
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    vec!["-iq".to_string()]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            execute_timeout_ms: default_execute_timeout_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            read_chunk_bytes: default_read_chunk_bytes(),
            shell: default_shell(),
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
        }
    }
}

impl SessionConfig {
    /// Set the per-call deadline
    #[must_use]
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the interpreter executable
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Per-call deadline
    #[must_use]
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    /// Advisory session lifetime, clamped to [`MAX_SESSION_TTL_SECS`]
    #[must_use]
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs.min(MAX_SESSION_TTL_SECS) as i64)
    }

    /// Resource ceiling for spawned interpreters
    #[must_use]
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::default().with_memory_mb(self.memory_limit_mb)
    }

    /// Launch configuration for the shell spawner
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            shell: self.shell.clone(),
            interpreter: self.interpreter.clone(),
            interpreter_args: self.interpreter_args.clone(),
        }
    }

    /// Reject settings that would make every call fail
    pub fn validate(&self) -> Result<()> {
        if self.execute_timeout_ms == 0 {
            return Err(Error::Config("execute_timeout_ms must be positive".into()));
        }
        if self.memory_limit_mb == 0 {
            return Err(Error::Config("memory_limit_mb must be positive".into()));
        }
        if self.memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(Error::Config(format!(
                "memory_limit_mb must be at most {MAX_MEMORY_LIMIT_MB}"
            )));
        }
        if self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(Error::Config(format!(
                "session_ttl_secs must be at most {MAX_SESSION_TTL_SECS}"
            )));
        }
        if self.read_chunk_bytes == 0 {
            return Err(Error::Config("read_chunk_bytes must be positive".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(Error::Config("shell must not be empty".into()));
        }
        if self.interpreter.trim().is_empty() {
            return Err(Error::Config("interpreter must not be empty".into()));
        }
        Ok(())
    }
}

fn defaults() -> ConfigBuilder<DefaultState> {
    Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<SessionConfig> {
    let config: SessionConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from files and environment
pub fn load_config() -> Result<SessionConfig> {
    finish(
        defaults()
            // External overrides (optional)
            .add_source(File::with_name("config/replpool").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Environment variables (highest priority)
            .add_source(
                Environment::with_prefix("REPLPOOL")
                    .prefix_separator("_")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("interpreter_args"),
            ),
    )
}

/// Parse a TOML document layered over the embedded defaults
pub fn parse_config(toml: &str) -> Result<SessionConfig> {
    finish(defaults().add_source(File::from_str(toml, FileFormat::Toml)))
}
