//! Restricted spawn of interactive interpreters
//!
//! A [`Spawner`] turns a [`ResourceLimits`] policy into a running interpreter
//! with all three standard streams piped. Spawning is all-or-nothing: if a
//! stream cannot be captured the child is killed and reaped before the error
//! is returned.

use crate::error::{Error, Result};
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

/// Applies the memory ceiling, then replaces the shell with the interpreter.
/// `$1` is the ceiling in KiB, the remaining arguments are the interpreter argv.
const LAUNCH_SCRIPT: &str = r#"ulimit -v "$1" || exit 126; shift; exec "$@""#;

/// `$0` of the launch script, shows up in shell diagnostics
const LAUNCH_NAME: &str = "replpool";

/// How the interpreter is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Shell used to apply resource limits
    pub shell: String,
    /// Interpreter executable
    pub interpreter: String,
    /// Interpreter arguments (interactive, quiet)
    pub interpreter_args: Vec<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-iq".to_string()],
        }
    }
}

/// A running interpreter and its three standard streams
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Child process handle (killed on drop)
    pub child: Child,
    /// Interpreter standard input
    pub stdin: ChildStdin,
    /// Interpreter standard output
    pub stdout: ChildStdout,
    /// Interpreter standard error (diagnostics and prompts)
    pub stderr: ChildStderr,
}

impl SpawnedProcess {
    /// OS process id, `None` once the child has been reaped
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Restricted spawn capability
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start an interpreter under `limits`
    async fn spawn(&self, limits: &ResourceLimits) -> Result<SpawnedProcess>;
}

/// Spawner that applies limits through a shell's `ulimit` builtin
#[derive(Debug, Clone, Default)]
pub struct ShellSpawner {
    config: SpawnConfig,
}

impl ShellSpawner {
    /// Create a spawner for the given launch configuration
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }

    /// Get the launch configuration
    #[must_use]
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Build the shell command line.
    ///
    /// The interpreter and its arguments are passed positionally so they are
    /// never interpreted by the shell.
    fn command(&self, limits: &ResourceLimits) -> Command {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(LAUNCH_SCRIPT)
            .arg(LAUNCH_NAME)
            .arg(limits.memory_kib().to_string())
            .arg(&self.config.interpreter)
            .args(&self.config.interpreter_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Spawner for ShellSpawner {
    #[instrument(skip(self), fields(shell = %self.config.shell, interpreter = %self.config.interpreter))]
    async fn spawn(&self, limits: &ResourceLimits) -> Result<SpawnedProcess> {
        let mut child = self.command(limits).spawn().map_err(Error::Spawn)?;

        match take_pipes(&mut child) {
            Ok((stdin, stdout, stderr)) => {
                debug!(pid = ?child.id(), memory_kib = limits.memory_kib(), "Interpreter spawned");
                Ok(SpawnedProcess {
                    child,
                    stdin,
                    stdout,
                    stderr,
                })
            }
            Err(e) => {
                terminate(&mut child).await;
                Err(e)
            }
        }
    }
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdin, ChildStdout, ChildStderr)> {
    let stdin = child.stdin.take().ok_or(Error::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(Error::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(Error::MissingPipe("stderr"))?;
    Ok((stdin, stdout, stderr))
}

/// Kill and reap a child so no zombie or orphan is left behind
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill half-spawned interpreter");
    }
}
