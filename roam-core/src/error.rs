//
// error.rs - Error severity classification for the core
//
// Purpose:
//   Collaborator boundaries (routemgr, icmp6/arp, intercom, task queue, TUN) all report
//   failures as plain `io::Error`. This module attaches the four severities from the design's
//   error handling section so call sites can match on them instead of downcasting strings.
//

use std::fmt;
use std::io;

/// Severity of a failure observed at a collaborator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorKind {
    /// Unable to open TUN, unable to bind the special-IP socket, internal state corruption.
    /// Callers are expected to log and exit.
    Fatal,
    /// EAGAIN-class I/O. Retry on next readiness event.
    Transient,
    /// A logic invariant was violated (e.g. a seek scheduled for an already-known client).
    /// Logged loudly, the action is suppressed, and the handler continues.
    LogicViolation,
    /// A benign miss: delete of an unknown MAC, info for an unknown MAC, a packet outside
    /// any configured prefix. Silently dropped or debug-logged.
    Benign,
}

impl fmt::Display for CoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreErrorKind::Fatal => write!(f, "fatal"),
            CoreErrorKind::Transient => write!(f, "transient"),
            CoreErrorKind::LogicViolation => write!(f, "logic violation"),
            CoreErrorKind::Benign => write!(f, "benign"),
        }
    }
}

#[derive(Debug)]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        CoreError {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> io::Error {
        CoreError::new(CoreErrorKind::Fatal, message).into_io()
    }

    pub fn logic_violation(message: impl Into<String>) -> io::Error {
        CoreError::new(CoreErrorKind::LogicViolation, message).into_io()
    }

    pub fn benign(message: impl Into<String>) -> io::Error {
        CoreError::new(CoreErrorKind::Benign, message).into_io()
    }

    /// Wraps this error as an `io::Error` so collaborator boundaries keep a single error
    /// currency; the severity survives inside via [`core_error_kind`].
    pub fn into_io(self) -> io::Error {
        let kind = match self.kind {
            CoreErrorKind::Fatal => io::ErrorKind::Other,
            CoreErrorKind::Transient => io::ErrorKind::WouldBlock,
            CoreErrorKind::LogicViolation => io::ErrorKind::Other,
            CoreErrorKind::Benign => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

/// Recovers the [`CoreErrorKind`] stamped onto an `io::Error` by [`CoreError::into_io`], if
/// any. Errors that crossed a collaborator boundary without going through `CoreError` (e.g.
/// a raw `io::Error::last_os_error()`) are treated as [`CoreErrorKind::Transient`] when they
/// carry `WouldBlock`/`Interrupted`, otherwise [`CoreErrorKind::Fatal`].
pub fn core_error_kind(err: &io::Error) -> CoreErrorKind {
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<CoreError>()) {
        return inner.kind;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => CoreErrorKind::Transient,
        _ => CoreErrorKind::Fatal,
    }
}
