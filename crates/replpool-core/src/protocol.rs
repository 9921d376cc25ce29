//! Sentinel framing over interpreter streams
//!
//! Interactive interpreters give no length prefix and no end-of-reply signal,
//! so each request carries a statement that prints a fresh token on both the
//! output and the diagnostic stream once the submitted code has run:
//!
//! ```text
//! <code>\n
//! \n
//! print('<token>'); print('<token>', file=__import__('sys').stderr)\n
//! ```
//!
//! The blank line closes any compound statement left open by the code. The
//! reply on each stream is everything before the first occurrence of the token.
//! Tokens are per call, so output left over from a call that timed out carries
//! a different token; it is recognised by shape and discarded.

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

/// Primary prompt echoed on the diagnostic stream
pub const PRIMARY_PROMPT: &str = ">>> ";

/// Continuation prompt echoed on the diagnostic stream
pub const CONTINUATION_PROMPT: &str = "... ";

const TOKEN_PREFIX: &str = "__END_";
const TOKEN_SUFFIX: &str = "__";

/// Upper bound on unread output kept between calls
pub const MAX_BACKLOG_BYTES: usize = 1024 * 1024;

const MARKER_PATTERN: &str = r"__END_[0-9a-f]{32}__\r?\n?";

/// Any sentinel line, including ones from earlier calls
static MARKER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MARKER_PATTERN).expect("marker regex"));

static MARKER_LINE_BYTES: LazyLock<regex::bytes::Regex> =
    LazyLock::new(|| regex::bytes::Regex::new(MARKER_PATTERN).expect("marker regex"));

/// Per-call end-of-reply marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Sentinel {
    /// Generate a fresh, practically unique sentinel
    #[must_use]
    pub fn generate() -> Self {
        Self {
            token: format!("{}{}{}", TOKEN_PREFIX, Uuid::new_v4().simple(), TOKEN_SUFFIX),
        }
    }

    /// The literal token
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Build the request written to the interpreter's input stream
    #[must_use]
    pub fn frame(&self, code: &str) -> String {
        format!(
            "{code}\n\nprint('{tok}'); print('{tok}', file=__import__('sys').stderr)\n",
            code = code,
            tok = self.token
        )
    }

    /// Locate the token in `buf`, scanning from `from`.
    ///
    /// Returns the byte offset of the token's first byte.
    #[must_use]
    pub fn find(&self, buf: &[u8], from: usize) -> Option<usize> {
        let needle = self.token.as_bytes();
        if from >= buf.len() || buf.len() - from < needle.len() {
            return None;
        }
        buf[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| from + pos)
    }

    /// Where to resume scanning after a read that grew the buffer past
    /// `previous_len`, so a token split across two reads is still found.
    #[must_use]
    pub fn rescan_from(&self, previous_len: usize) -> usize {
        previous_len.saturating_sub(self.token.len() - 1)
    }

    /// End of the marker found at `at`, including one line terminator.
    ///
    /// `None` while the byte after the token (or the `\n` after a `\r`) has
    /// not been read yet. A token followed by anything else ends at the token.
    #[must_use]
    pub fn marker_end(&self, buf: &[u8], at: usize) -> Option<usize> {
        let after = at + self.token.len();
        match buf.get(after..)? {
            [] | [b'\r'] => None,
            [b'\r', b'\n', ..] => Some(after + 2),
            [b'\n', ..] => Some(after + 1),
            _ => Some(after),
        }
    }
}

/// Shrink output left over from calls that did not complete.
///
/// Everything before the last stale marker is a finished reply nobody is
/// waiting for. The marker itself stays, so its line terminator is removed
/// together with it once the current reply is parsed, even if the terminator
/// has not been read yet. What remains is capped at [`MAX_BACKLOG_BYTES`],
/// keeping the newest bytes.
pub fn discard_backlog(buf: &mut Vec<u8>) {
    if let Some(stale) = MARKER_LINE_BYTES.find_iter(buf).last() {
        let start = stale.start();
        buf.drain(..start);
    }
    if buf.len() > MAX_BACKLOG_BYTES {
        let excess = buf.len() - MAX_BACKLOG_BYTES;
        buf.drain(..excess);
    }
}

/// Text preceding the marker, minus anything left over from earlier calls
fn reply_text(buf: &[u8], marker_at: usize) -> String {
    let text = String::from_utf8_lossy(&buf[..marker_at]);
    match MARKER_LINE.find_iter(&text).last() {
        Some(stale) => text[stale.end()..].to_string(),
        None => text.into_owned(),
    }
}

/// Output stream reply: everything before the marker.
///
/// Any `__END_<32 hex>__` line the code itself prints is taken for a stale
/// marker, and the output before it is dropped.
#[must_use]
pub fn parse_stdout(buf: &[u8], marker_at: usize) -> String {
    reply_text(buf, marker_at)
}

/// Diagnostic stream reply with prompt echoes removed and whitespace trimmed
#[must_use]
pub fn parse_stderr(buf: &[u8], marker_at: usize) -> String {
    clean_diagnostics(&reply_text(buf, marker_at))
}

/// Remove interactive prompt echoes and surrounding whitespace
#[must_use]
pub fn clean_diagnostics(text: &str) -> String {
    text.replace(PRIMARY_PROMPT, "")
        .replace(CONTINUATION_PROMPT, "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_shape() {
        let s = Sentinel::generate();
        assert!(s.token().starts_with("__END_"));
        assert!(s.token().ends_with("__"));
        assert_eq!(s.token().len(), 6 + 32 + 2);
        assert!(MARKER_LINE.is_match(s.token()));
        assert_ne!(s, Sentinel::generate());
    }

    #[test]
    fn test_frame_request() {
        let s = Sentinel::generate();
        let framed = s.frame("print('hello')");
        let tok = s.token();

        assert!(framed.starts_with("print('hello')\n\n"));
        assert!(framed.ends_with(&format!(
            "print('{tok}'); print('{tok}', file=__import__('sys').stderr)\n"
        )));
        assert_eq!(framed.matches('\n').count(), 3);
    }

    #[test]
    fn test_find_across_chunk_boundary() {
        let s = Sentinel::generate();
        let full = format!("hello\n{}\n", s.token());
        let bytes = full.as_bytes();

        // first read stops halfway through the token
        let split = 6 + 10;
        assert_eq!(s.find(&bytes[..split], 0), None);

        let from = s.rescan_from(split);
        assert_eq!(s.find(bytes, from), Some(6));
    }

    #[test]
    fn test_find_short_buffer() {
        let s = Sentinel::generate();
        assert_eq!(s.find(b"abc", 0), None);
        assert_eq!(s.find(b"", 0), None);
        assert_eq!(s.rescan_from(3), 0);
    }

    #[test]
    fn test_marker_end_waits_for_terminator() {
        let s = Sentinel::generate();
        let tok = s.token();

        let partial = format!("v\n{tok}");
        assert_eq!(s.marker_end(partial.as_bytes(), 2), None);
        let partial = format!("v\n{tok}\r");
        assert_eq!(s.marker_end(partial.as_bytes(), 2), None);

        let lf = format!("v\n{tok}\n>>> ");
        assert_eq!(s.marker_end(lf.as_bytes(), 2), Some(2 + tok.len() + 1));
        let crlf = format!("v\n{tok}\r\n");
        assert_eq!(s.marker_end(crlf.as_bytes(), 2), Some(crlf.len()));

        // an echoed request has no terminator after the token
        let echoed = format!("print('{tok}')");
        assert_eq!(s.marker_end(echoed.as_bytes(), 7), Some(7 + tok.len()));
    }

    #[test]
    fn test_parse_stdout_strips_marker() {
        let s = Sentinel::generate();
        let buf = format!("hello\n{}\n", s.token());
        let at = s.find(buf.as_bytes(), 0).unwrap();
        assert_eq!(parse_stdout(buf.as_bytes(), at), "hello\n");
    }

    #[test]
    fn test_parse_stdout_keeps_literal_end() {
        let s = Sentinel::generate();
        let buf = format!("__END__\n{}\n", s.token());
        let at = s.find(buf.as_bytes(), 0).unwrap();
        assert_eq!(parse_stdout(buf.as_bytes(), at), "__END__\n");
    }

    #[test]
    fn test_parse_stdout_drops_stale_reply() {
        let stale = Sentinel::generate();
        let s = Sentinel::generate();
        let buf = format!("late output\n{}\n42\n{}\n", stale.token(), s.token());
        let at = s.find(buf.as_bytes(), 0).unwrap();
        assert_eq!(parse_stdout(buf.as_bytes(), at), "42\n");
    }

    #[test]
    fn test_parse_stderr_removes_prompts() {
        let s = Sentinel::generate();
        let buf = format!(
            ">>> Traceback (most recent call last):\n  File \"<stdin>\", line 1, in <module>\nZeroDivisionError: division by zero\n>>> >>> {}\n",
            s.token()
        );
        let at = s.find(buf.as_bytes(), 0).unwrap();
        let stderr = parse_stderr(buf.as_bytes(), at);

        assert!(stderr.starts_with("Traceback"));
        assert!(stderr.ends_with("ZeroDivisionError: division by zero"));
        assert!(!stderr.contains(">>>"));
    }

    #[test]
    fn test_parse_stderr_quiet_run_is_empty() {
        let s = Sentinel::generate();
        let buf = format!(">>> ... ... >>> >>> {}\n", s.token());
        let at = s.find(buf.as_bytes(), 0).unwrap();
        assert_eq!(parse_stderr(buf.as_bytes(), at), "");
    }

    #[test]
    fn test_discard_backlog() {
        let stale = Sentinel::generate();
        let mut buf = format!("old\n{}\n>>> partial", stale.token()).into_bytes();
        discard_backlog(&mut buf);
        assert_eq!(buf, format!("{}\n>>> partial", stale.token()).into_bytes());

        // the terminator of the stale marker arrives after the backlog was cut
        let s = Sentinel::generate();
        buf.truncate(stale.token().len());
        discard_backlog(&mut buf);
        buf.extend_from_slice(format!("\nafter\n{}\n", s.token()).as_bytes());
        let at = s.find(&buf, 0).unwrap();
        assert_eq!(parse_stdout(&buf, at), "after\n");

        let mut buf = b"no marker yet".to_vec();
        discard_backlog(&mut buf);
        assert_eq!(buf, b"no marker yet");
    }

    #[test]
    fn test_discard_backlog_caps_size() {
        let mut buf = vec![b'1'; MAX_BACKLOG_BYTES + 10];
        buf.push(b'2');
        discard_backlog(&mut buf);
        assert_eq!(buf.len(), MAX_BACKLOG_BYTES);
        assert_eq!(buf.last(), Some(&b'2'));
    }

    #[test]
    fn test_clean_diagnostics() {
        assert_eq!(clean_diagnostics("  >>> ... oops\n"), "oops");
        assert_eq!(clean_diagnostics(""), "");
    }
}
