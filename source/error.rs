// Error *kinds* that call sites need to branch on. Each is a small marker type
// carried inside an `anyhow::Error` and recovered with `downcast_ref`, the same
// pattern the connection/session/fetch-loop layers use throughout this crate.

use std::{error, fmt};

/// Malformed IMAP input: framer or parser. Carries the offending frame so the
/// caller can log it.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub frame: Vec<Vec<u8>>,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "parse error: {} (frame: {:?})", self.message, self.frame)
    }
}

impl error::Error for ParseError {}

/// Unexpected response tag, missing required untagged responses after SELECT,
/// unknown FETCH attribute, and other violations of the protocol's shape that
/// aren't a server-reported command failure.
#[derive(Debug, Clone)]
pub struct ImapProtocolError(pub String);

impl fmt::Display for ImapProtocolError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "imap protocol error: {}", self.0)
    }
}

impl error::Error for ImapProtocolError {}

/// A tagged non-OK completion. Carries the state (`NO`/`BAD`) and the server's
/// response text verbatim so C6 can classify it as transient or fatal.
#[derive(Debug, Clone)]
pub struct ImapCommandError {
    pub state: crate::imap::parser::State,
    pub text: Vec<u8>,
}

impl fmt::Display for ImapCommandError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "imap command failed: {:?} {}",
            self.state,
            String::from_utf8_lossy(&self.text)
        )
    }
}

impl error::Error for ImapCommandError {}

/// Network idle beyond the configured read timeout, or the IDLE long-timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "timed out waiting for a response")
    }
}

impl error::Error for TimeoutError {}

/// A processor returned anything other than `true`, or panicked/errored.
/// Surfaced by the scanner; the outer loop treats this as fatal.
#[derive(Debug, Clone)]
pub struct ProcessorError(pub String);

impl fmt::Display for ProcessorError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "processor failed: {}", self.0)
    }
}

impl error::Error for ProcessorError {}

/// A real MailDB inconsistency: not a header-borne identifier that's simply
/// foreign to this database (those are silently ignored, not errors), but
/// something like re-merging an already-merged TUID into a different thread.
#[derive(Debug, Clone)]
pub struct MailDbError(pub String);

impl fmt::Display for MailDbError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "maildb error: {}", self.0)
    }
}

impl error::Error for MailDbError {}

/// A MUID/TUID string that doesn't parse, or whose prefix belongs to a
/// different database. Callers that only care about "does this belong to us"
/// should match on this and treat it as "no", not propagate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadIdError {
    Muid,
    Tuid,
}

impl fmt::Display for BadIdError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BadIdError::Muid => write!(formatter, "not a valid MUID for this database"),
            BadIdError::Tuid => write!(formatter, "not a valid TUID for this database"),
        }
    }
}

impl error::Error for BadIdError {}
