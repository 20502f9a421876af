//! A remote stream paired with a pty.
//!
//! The session drives the remote→shell direction on the caller's thread; the
//! shell→remote direction belongs to the bridge. Whichever side gives out
//! first tears the pairing down, and the other side notices on its next I/O.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::bridge::{PtyHandler, Spawner};
use super::error::{SessionError, SessionId};
use super::lock;
use super::remote::RemoteStream;
use super::terminal::WindowSize;

/// Size of the chunks read from the remote stream.
///
/// There is no framing: each chunk is forwarded to the shell as read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Lifecycle of a session, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built, bridge spawned, not reading yet.
    Created,
    /// Both directions are running.
    Running,
    /// The remote read loop ended; bridge teardown not finished yet.
    RemoteClosed,
    /// The bridge tore itself down; the remote is still attached.
    BridgeClosed,
    /// Both sides are done.
    Closed,
}

/// One remote stream bridged to one pty.
pub struct Session {
    /// Session identifier, copied from the bridge.
    id: SessionId,

    /// The remote stream. Cleared when the read loop ends, never set again.
    remote: Mutex<Option<Arc<dyn RemoteStream>>>,

    /// The pty side.
    handler: Arc<dyn PtyHandler>,

    /// Set once `handle_connection` has been entered.
    started: AtomicBool,
}

impl Session {
    /// Pairs a remote stream with an already spawned pty handler.
    pub fn new(remote: Arc<dyn RemoteStream>, handler: Arc<dyn PtyHandler>) -> Self {
        Self {
            id: handler.id(),
            remote: Mutex::new(Some(remote)),
            handler,
            started: AtomicBool::new(false),
        }
    }

    /// Spawns a pty handler whose output goes to `remote` and pairs them.
    pub fn spawn(remote: Arc<dyn RemoteStream>, spawner: &dyn Spawner) -> Result<Self, SessionError> {
        let handler = spawner.spawn(Arc::clone(&remote))?;
        Ok(Self::new(remote, handler))
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns true once the read loop has been started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        let remote_gone = lock(&self.remote).is_none();
        let bridge_gone = self.handler.is_closed();

        match (self.is_started(), remote_gone, bridge_gone) {
            (_, true, true) => SessionState::Closed,
            (_, false, true) => SessionState::BridgeClosed,
            (_, true, false) => SessionState::RemoteClosed,
            (false, false, false) => SessionState::Created,
            (true, false, false) => SessionState::Running,
        }
    }

    /// Runs the session until the remote stops sending.
    ///
    /// Starts the bridge on its own thread, then copies remote input to the
    /// shell. When the remote read fails or reaches EOF (or the shell can no
    /// longer be written to), the remote is cleared and the bridge is torn
    /// down. Only the first call does anything.
    pub fn handle_connection(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(session_id = self.id, "Session already handling its connection");
            return;
        }

        let Some(remote) = lock(&self.remote).clone() else {
            return;
        };

        let handler = Arc::clone(&self.handler);
        let spawned = thread::Builder::new()
            .name(format!("tty-{}-bridge", self.id))
            .spawn(move || handler.run());
        if let Err(e) = spawned {
            tracing::error!(session_id = self.id, error = %e, "Failed to start bridge");
            self.finish();
            return;
        }

        tracing::debug!(session_id = self.id, "Session read loop started");

        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = match remote.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(session_id = self.id, "Remote stream reached EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(session_id = self.id, error = %e, "Remote read failed");
                    break;
                }
            };

            if let Err(e) = self.forward(&buf[..n]) {
                tracing::debug!(session_id = self.id, error = %e, "PTY write failed");
                break;
            }
        }

        self.finish();
    }

    /// Writes a whole chunk to the shell.
    fn forward(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.handler.write(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "PTY accepted no bytes",
                    ))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drops the remote and tears the bridge down.
    fn finish(&self) {
        lock(&self.remote).take();
        self.handler.close();
        tracing::info!(session_id = self.id, "Session read loop finished");
    }

    /// Writes bytes to the remote side.
    ///
    /// Fails with [`SessionError::RemoteGone`] once the read loop has ended.
    pub fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        let remote = lock(&self.remote)
            .clone()
            .ok_or(SessionError::RemoteGone(self.id))?;
        Ok(remote.write(data)?)
    }

    /// Propagates a new window size to the pty.
    pub fn resize(&self, size: WindowSize) {
        self.handler.resize(size);
    }

    /// Tears the bridge down.
    ///
    /// Safe to call from any thread and any number of times. Does not remove
    /// the session from a registry.
    pub fn close(&self) {
        self.handler.close();
    }
}
