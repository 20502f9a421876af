//! Session registry.
//!
//! The manager is the single source of truth for which sessions exist. It is
//! constructed once and shared by reference (usually behind an `Arc`) with
//! everything that creates, starts or closes sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::Config;

use super::bridge::{PtySpawner, Spawner};
use super::error::{SessionError, SessionId};
use super::remote::RemoteStream;
use super::session::{Session, SessionState};
use super::terminal::WindowSize;

/// Thread-safe session registry backed by a `DashMap`.
///
/// A session stays registered until it is closed through the manager, even
/// after both of its copy loops have ended on their own. Callers that do not
/// track completion themselves can poll [`SessionManager::session_state`] or
/// call [`SessionManager::reap_finished`].
pub struct SessionManager {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,

    /// Builds the pty side of new sessions.
    spawner: Arc<dyn Spawner>,

    /// Maximum number of registered sessions, if limited.
    max_sessions: Option<usize>,

    /// Registered sessions plus creations in flight. Checked against
    /// `max_sessions` before spawning.
    slots: AtomicUsize,
}

impl SessionManager {
    /// Creates a manager with no session limit.
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            sessions: DashMap::new(),
            spawner,
            max_sessions: None,
            slots: AtomicUsize::new(0),
        }
    }

    /// Creates a manager that refuses to register more than `max_sessions`.
    pub fn with_limit(spawner: Arc<dyn Spawner>, max_sessions: usize) -> Self {
        Self {
            max_sessions: Some(max_sessions),
            ..Self::new(spawner)
        }
    }

    /// Creates a manager that runs the configured shell under the
    /// configured terminal, limited to `max_sessions`.
    pub fn from_config(config: &Config) -> Self {
        let spawner = PtySpawner::new(config.shell_command(), config.terminal());
        Self::with_limit(Arc::new(spawner), config.session.max_sessions)
    }

    /// Creates a session for `remote` and registers it.
    ///
    /// The shell is spawned immediately but nothing is read from the remote
    /// until [`SessionManager::start_session`] is called.
    pub fn create_session(&self, remote: Arc<dyn RemoteStream>) -> Result<SessionId, SessionError> {
        self.reserve_slot()?;

        let session = match Session::spawn(remote, self.spawner.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };
        let session_id = session.id();

        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => {
                // Never expected while the registered session holds its fd.
                session.close();
                self.release_slot();
                tracing::error!(session_id, "Session id already registered");
                return Err(SessionError::DuplicateId(session_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(session));
            }
        }

        tracing::info!(session_id, sessions = self.sessions.len(), "Created new session");
        Ok(session_id)
    }

    /// Starts a registered session on its own thread and returns immediately.
    pub fn start_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let session = self.get(session_id)?;

        if session.is_started() {
            return Err(SessionError::AlreadyStarted(session_id));
        }

        thread::Builder::new()
            .name(format!("tty-{session_id}-session"))
            .spawn(move || session.handle_connection())?;

        tracing::debug!(session_id, "Session started");
        Ok(())
    }

    /// Tears a session down and removes it from the registry.
    ///
    /// A second close of the same id fails with [`SessionError::NotFound`].
    pub fn close_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let session = self.get(session_id)?;

        session.close();

        // Removal is the last step; a concurrent close may have won the race.
        if self.sessions.remove(&session_id).is_none() {
            return Err(SessionError::NotFound(session_id));
        }
        self.release_slot();

        tracing::info!(session_id, "Session closed and removed");
        Ok(())
    }

    /// Propagates a new window size to a session's pty.
    pub fn resize_session(&self, session_id: SessionId, size: WindowSize) -> Result<(), SessionError> {
        self.get(session_id)?.resize(size);
        Ok(())
    }

    /// Writes bytes to a session's remote side.
    pub fn write_to_session(&self, session_id: SessionId, data: &[u8]) -> Result<usize, SessionError> {
        self.get(session_id)?.write(data)
    }

    /// Returns the lifecycle state of a registered session.
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.sessions.get(&session_id).map(|entry| entry.value().state())
    }

    /// Checks if a session is registered.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Lists registered session IDs, in ascending order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Closes and removes every session whose state is [`SessionState::Closed`].
    ///
    /// Returns the IDs that were removed.
    pub fn reap_finished(&self) -> Vec<SessionId> {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Closed)
            .map(|entry| *entry.key())
            .collect();

        finished
            .into_iter()
            .filter(|&id| self.close_session(id).is_ok())
            .inspect(|id| tracing::debug!(session_id = id, "Reaped finished session"))
            .collect()
    }

    /// Closes and removes every registered session.
    pub fn close_all(&self) {
        for session_id in self.ids() {
            if let Err(e) = self.close_session(session_id) {
                tracing::debug!(session_id, error = %e, "Session already gone");
            }
        }
    }

    /// Claims room for one more session, or fails if the limit is reached.
    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.max_sessions.unwrap_or(usize::MAX);
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::LimitReached(max))
    }

    fn release_slot(&self) {
        self.slots.fetch_sub(1, Ordering::SeqCst);
    }

    fn get(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        // Clone out of the map so no shard lock is held during session I/O.
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound(session_id))
    }
}
