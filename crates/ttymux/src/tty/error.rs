//! Error types for session operations.

use thiserror::Error;

/// Identifier of a session.
///
/// Taken from the raw file descriptor of the session's pty master. It is
/// unique among registered sessions, but the OS recycles descriptors, so an
/// id may equal the id of a session that was closed earlier.
pub type SessionId = i32;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Allocating the pty or spawning the shell failed.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// The host terminal's window size could not be queried.
    #[error("failed to query terminal size: {0}")]
    TerminalSize(String),

    /// Entering or leaving raw mode failed.
    #[error("terminal mode error: {0}")]
    TerminalMode(String),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's read loop was already started.
    #[error("session already started: {0}")]
    AlreadyStarted(SessionId),

    /// A registered session already uses this id.
    #[error("session id already registered: {0}")]
    DuplicateId(SessionId),

    /// The manager refuses to host more sessions.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// The remote side of the session has gone away.
    #[error("remote stream closed for session {0}")]
    RemoteGone(SessionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
