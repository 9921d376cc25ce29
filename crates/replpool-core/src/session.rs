//! Interpreter sessions and the execution protocol engine
//!
//! A [`Session`] owns one restricted interpreter and its three streams. Each
//! [`Session::execute`] call writes a sentinel-framed request, then drains the
//! output and diagnostic streams concurrently until both carry the call's
//! sentinel, all under a single deadline.
//!
//! Calls on one session are serialised by the lock around its streams; a
//! second caller waits for the first to finish. Calls on different sessions
//! share nothing and run fully in parallel.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::{discard_backlog, parse_stderr, parse_stdout, Sentinel};
use chrono::{DateTime, Utc};
use replpool_sandbox::SpawnedProcess;
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Streams open, no call in flight
    Idle,
    /// A call is in flight
    Executing,
    /// Process terminated, streams released
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Executing,
            _ => Self::Closed,
        }
    }
}

/// Result of a successful `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    /// Interpreter output with the sentinel removed
    pub stdout: String,
    /// Interpreter diagnostics with prompt echoes removed, trimmed
    pub stderr: String,
}

/// Summary view of a session (for list endpoints).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session ID
    pub id: String,
    /// Current state
    pub state: SessionState,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Advisory expiry
    pub expires_at: DateTime<Utc>,
    /// Whether the advisory expiry has passed
    pub expired: bool,
}

/// The interpreter and its streams. Released together.
///
/// The read buffers keep bytes read by a call that did not complete, so the
/// next call sees late replies whole and can discard them. `pending_input`
/// holds the unwritten tail of a request whose write was interrupted; it is
/// written before the next request so the input stream never carries half a
/// frame.
struct SessionIo {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    pending_input: Vec<u8>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
}

impl From<SpawnedProcess> for SessionIo {
    fn from(process: SpawnedProcess) -> Self {
        Self {
            child: process.child,
            stdin: process.stdin,
            stdout: process.stdout,
            stderr: process.stderr,
            pending_input: Vec::new(),
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Output,
    Diagnostic,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Self::Output => "stdout",
            Self::Diagnostic => "stderr",
        }
    }

    fn read_context(self) -> &'static str {
        match self {
            Self::Output => "failed to read stdout",
            Self::Diagnostic => "failed to read stderr",
        }
    }
}

/// A long-lived interpreter session.
pub struct Session {
    id: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    timeout: Duration,
    chunk_bytes: usize,
    state: AtomicU8,
    io: Mutex<Option<SessionIo>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Wrap a spawned interpreter.
    ///
    /// `parent` cancels in-flight calls when the owner shuts down.
    pub(crate) fn new(
        id: String,
        process: SpawnedProcess,
        config: &SessionConfig,
        parent: &CancellationToken,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            pid: process.pid(),
            created_at,
            expires_at: created_at
                .checked_add_signed(config.session_ttl())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            timeout: config.execute_timeout(),
            chunk_bytes: config.read_chunk_bytes,
            state: AtomicU8::new(SessionState::Idle as u8),
            io: Mutex::new(Some(process.into())),
            cancel: parent.child_token(),
        }
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Interpreter process id at spawn time
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Creation timestamp
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Advisory expiry (`created_at` + TTL). Nothing enforces it.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the advisory expiry has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Summary view
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            expired: self.is_expired(),
        }
    }

    /// Run `code` in the interpreter and return its output and diagnostics.
    ///
    /// Exceptions raised by the code are reported in `stderr`, not as errors.
    /// Errors are transport faults only: [`Error::ExecutionTimeout`] when the
    /// reply is not complete within the deadline, otherwise a system error.
    /// A timed-out session stays usable; its late output is discarded by the
    /// next call.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutput> {
        self.execute_with_cancel(code, &CancellationToken::new()).await
    }

    /// Like [`execute`](Self::execute), also stopping when `cancel` fires.
    #[instrument(skip(self, code, cancel), fields(session_id = %self.id, code_len = code.len()))]
    pub async fn execute_with_cancel(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| Error::SessionClosed(self.id.clone()))?;

        self.set_state(SessionState::Executing);
        let call = self.cancel.child_token();
        let sentinel = Sentinel::generate();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            exchanged = tokio::time::timeout(
                self.timeout,
                exchange(io, code, &sentinel, self.chunk_bytes, &call),
            ) => exchanged.unwrap_or_else(|_| Err(Error::ExecutionTimeout(self.timeout.as_millis() as u64))),
        };
        call.cancel();

        match &outcome {
            Ok(output) => debug!(
                stdout_len = output.stdout.len(),
                stderr_len = output.stderr.len(),
                "Execution completed"
            ),
            Err(Error::ExecutionTimeout(ms)) => {
                warn!(timeout_ms = ms, "Execution timed out, interpreter left running")
            }
            Err(Error::StreamClosed(_)) | Err(Error::Io { .. }) => {
                let status = io.child.try_wait().ok().flatten();
                warn!(exit_status = ?status, error = ?outcome.as_ref().err(), "Interpreter stream failed");
            }
            Err(e) => debug!(error = %e, "Execution aborted"),
        }

        self.set_state(SessionState::Idle);
        outcome
    }

    /// Terminate the interpreter and release its streams.
    ///
    /// Cancels any call in flight first. Returns `false` if already closed.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn close(&self) -> bool {
        self.cancel.cancel();
        let mut guard = self.io.lock().await;
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);

        let Some(mut io) = guard.take() else {
            return false;
        };
        if let Err(e) = io.child.kill().await {
            warn!(error = %e, "Failed to kill interpreter");
        }
        info!("Session closed");
        true
    }

    fn set_state(&self, state: SessionState) {
        // Closed is terminal
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != SessionState::Closed as u8).then_some(state as u8)
            });
    }
}

/// One request/response round trip.
async fn exchange(
    io: &mut SessionIo,
    code: &str,
    sentinel: &Sentinel,
    chunk_bytes: usize,
    cancel: &CancellationToken,
) -> Result<ExecutionOutput> {
    discard_backlog(&mut io.stdout_buf);
    discard_backlog(&mut io.stderr_buf);

    io.pending_input.extend_from_slice(sentinel.frame(code).as_bytes());
    write_pending(&mut io.stdin, &mut io.pending_input).await?;

    let (out, err) = tokio::try_join!(
        read_until_sentinel(
            &mut io.stdout,
            &mut io.stdout_buf,
            Stream::Output,
            sentinel,
            chunk_bytes,
            cancel
        ),
        read_until_sentinel(
            &mut io.stderr,
            &mut io.stderr_buf,
            Stream::Diagnostic,
            sentinel,
            chunk_bytes,
            cancel
        ),
    )?;

    let output = ExecutionOutput {
        stdout: parse_stdout(&io.stdout_buf, out.start),
        stderr: parse_stderr(&io.stderr_buf, err.start),
    };
    // bytes after the marker (the next prompt) belong to no reply yet
    io.stdout_buf.drain(..out.end);
    io.stderr_buf.drain(..err.end);
    Ok(output)
}

/// Write and flush everything in `pending`.
///
/// Bytes leave `pending` only once the pipe has accepted them, so a write
/// dropped by the deadline resumes where it stopped.
async fn write_pending<W>(writer: &mut W, pending: &mut Vec<u8>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !pending.is_empty() {
        let n = writer
            .write(pending)
            .await
            .map_err(Error::io("failed to write to stdin"))?;
        if n == 0 {
            return Err(Error::StreamClosed("stdin"));
        }
        pending.drain(..n);
    }
    writer
        .flush()
        .await
        .map_err(Error::io("failed to flush stdin"))
}

/// Append a stream to `buf` until the sentinel and its line terminator show up.
///
/// Returns the marker's byte range in `buf`. Keeps reading whatever the
/// interpreter writes, so the child never blocks on a full pipe.
async fn read_until_sentinel<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    stream: Stream,
    sentinel: &Sentinel,
    chunk_bytes: usize,
    cancel: &CancellationToken,
) -> Result<Range<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; chunk_bytes];
    let mut found = None;
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            read = reader.read(&mut chunk) => read.map_err(Error::io(stream.read_context()))?,
        };
        if n == 0 {
            return Err(Error::StreamClosed(stream.name()));
        }

        let previous_len = buf.len();
        buf.extend_from_slice(&chunk[..n]);
        if found.is_none() {
            found = sentinel.find(buf, sentinel.rescan_from(previous_len));
        }
        if let Some(at) = found {
            if let Some(end) = sentinel.marker_end(buf, at) {
                return Ok(at..end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use replpool_sandbox::{ShellSpawner, Spawner};

    /// `cat` echoes the framed request, so the sentinel reaches stdout but
    /// never stderr.
    async fn echo_session(timeout_ms: u64) -> Session {
        let config = SessionConfig {
            execute_timeout_ms: timeout_ms,
            interpreter: "cat".to_string(),
            interpreter_args: Vec::new(),
            ..SessionConfig::default()
        };
        spawn_session(config).await
    }

    async fn spawn_session(config: SessionConfig) -> Session {
        let process = ShellSpawner::new(config.spawn_config())
            .spawn(&config.resource_limits())
            .await
            .unwrap();
        Session::new(
            "test-session".to_string(),
            process,
            &config,
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_new_session_metadata() {
        let session = echo_session(200).await;
        assert_eq!(session.id(), "test-session");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.pid().is_some());
        assert_eq!(
            session.expires_at() - session.created_at(),
            chrono::Duration::minutes(5)
        );
        assert!(!session.is_expired());

        let summary = session.summary();
        assert_eq!(summary.id, "test-session");
        assert!(!summary.expired);
    }

    #[tokio::test]
    async fn test_timeout_when_diagnostic_sentinel_missing() {
        let session = echo_session(200).await;

        let err = session.execute("print('hello')").await.unwrap_err();
        assert!(matches!(err, Error::ExecutionTimeout(200)));
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // the session is still usable after a timeout
        assert_eq!(session.state(), SessionState::Idle);
        let err = session.execute("print('again')").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_dead_interpreter_is_system_error() {
        let config = SessionConfig {
            interpreter: "true".to_string(),
            interpreter_args: Vec::new(),
            ..SessionConfig::default()
        };
        let session = spawn_session(config).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = session.execute("print('hello')").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[tokio::test]
    async fn test_close_releases_session() {
        let session = echo_session(200).await;

        assert!(session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.close().await);

        let err = session.execute("print('hello')").await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed(ref id) if id == "test-session"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let session = echo_session(5_000).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session
            .execute_with_cancel("print('hello')", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_read_until_sentinel_split_reads() {
        let sentinel = Sentinel::generate();
        let payload = format!("42\n{}\n", sentinel.token());
        let mut reader = payload.as_bytes();

        let mut buf = format!("late\n{}\n", Sentinel::generate().token()).into_bytes();
        let marker = read_until_sentinel(
            &mut reader,
            &mut buf,
            Stream::Output,
            &sentinel,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(marker, 49..buf.len());
        assert_eq!(parse_stdout(&buf, marker.start), "42\n");
    }

    #[tokio::test]
    async fn test_read_until_sentinel_waits_for_terminator() {
        let sentinel = Sentinel::generate();
        let mut reader = tokio_test::io::Builder::new()
            .read(format!("v\n{}", sentinel.token()).as_bytes())
            .read(b"\n")
            .build();

        let mut buf = Vec::new();
        let marker = read_until_sentinel(
            &mut reader,
            &mut buf,
            Stream::Output,
            &sentinel,
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(marker, 2..buf.len());
        assert_eq!(parse_stdout(&buf, marker.start), "v\n");

        // nothing of this call is left for the next one
        buf.drain(..marker.end);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_write_resumes() {
        let (mut writer, mut reader) = tokio::io::duplex(8);
        let request = b"0123456789abcdefghijklmnopqrstuv".to_vec();
        let mut pending = request.clone();

        // nobody reads, so the pipe fills and the deadline drops the write
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            write_pending(&mut writer, &mut pending),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(pending.len(), request.len() - 8);

        let drain = tokio::spawn(async move {
            let mut received = vec![0u8; 32];
            reader.read_exact(&mut received).await.unwrap();
            received
        });
        write_pending(&mut writer, &mut pending).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(drain.await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_panic() {
        let config = SessionConfig {
            session_ttl_secs: u64::MAX,
            interpreter: "cat".to_string(),
            interpreter_args: Vec::new(),
            ..SessionConfig::default()
        };
        let session = spawn_session(config).await;
        assert!(session.expires_at() > session.created_at());
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn test_read_until_sentinel_eof() {
        let sentinel = Sentinel::generate();
        let mut reader: &[u8] = b"partial output";

        let mut buf = Vec::new();
        let err = read_until_sentinel(
            &mut reader,
            &mut buf,
            Stream::Diagnostic,
            &sentinel,
            8,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::StreamClosed("stderr")));
        assert_eq!(buf, b"partial output");
    }
}
