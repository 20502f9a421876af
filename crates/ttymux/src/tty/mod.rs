//! Terminal session engine.
//!
//! This module bridges remote byte streams to shells running inside
//! pseudo-terminals. It is split the same way the data flows:
//!
//! - [`bridge`]: one pty device plus its child shell, output copy and teardown
//! - [`session`]: one remote stream paired with one bridge, input copy
//! - [`manager`]: the registry of live sessions
//! - [`remote`]: the [`RemoteStream`] capability and its transports
//! - [`terminal`]: window size and raw-mode control of the host terminal

pub mod bridge;
pub mod error;
pub mod manager;
pub mod remote;
pub mod session;
pub mod terminal;

pub use bridge::{PtyBridge, PtyHandler, PtySpawner, ShellCommand, Spawner};
pub use error::{SessionError, SessionId};
pub use manager::SessionManager;
pub use remote::{MemoryStream, RemoteStream};
pub use session::{Session, SessionState};
pub use terminal::{DetachedTerminal, HostTerminal, SavedMode, TerminalControl, WindowSize};

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Teardown must still run after a panic in one of the copy threads, so a
/// poisoned lock is not treated as fatal.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
