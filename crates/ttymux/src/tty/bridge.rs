//! PTY bridge.
//!
//! A bridge owns one pseudo-terminal device and the shell running on it. It
//! copies everything the shell prints into a sink (the session's remote
//! stream), accepts writes destined for the shell, and owns the teardown that
//! kills the shell and restores the host terminal.
//!
//! Teardown can be triggered from three places at once: the child-exit wait
//! in [`PtyBridge::run`], the output copy thread, and an explicit close from
//! the session. It runs exactly once; late callers wait for it to finish.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};

use super::error::{SessionError, SessionId};
use super::lock;
use super::remote::{RemoteStream, StreamWriter};
use super::terminal::{SavedMode, TerminalControl, WindowSize};

/// Shell used when `$SHELL` is not set.
pub const DEFAULT_SHELL: &str = "bash";

/// How often a waiting bridge checks whether its shell has exited.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The pty side of a session, as seen by [`Session`](super::Session).
pub trait PtyHandler: Send + Sync {
    /// Identifier of the underlying device.
    fn id(&self) -> SessionId;

    /// Writes bytes to the shell's input.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Runs the bridge until the shell exits. Blocks the calling thread.
    fn run(self: Arc<Self>);

    /// Propagates a new window size. Best-effort.
    fn resize(&self, size: WindowSize);

    /// Stops the shell and restores the terminal. Idempotent.
    fn close(&self);

    /// Returns true once teardown has completed.
    fn is_closed(&self) -> bool;
}

/// Builds the pty side of a new session.
pub trait Spawner: Send + Sync {
    /// Spawns a handler whose output goes to `sink`.
    fn spawn(&self, sink: Arc<dyn RemoteStream>) -> Result<Arc<dyn PtyHandler>, SessionError>;
}

/// The command a bridge runs inside its pty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Working directory, or the current one if unset.
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    /// Creates a command for `program` with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// The user's shell: `$SHELL`, or [`DEFAULT_SHELL`] when unset or empty.
    pub fn from_env() -> Self {
        Self::new(default_shell())
    }

    fn to_builder(&self) -> CommandBuilder {
        // CommandBuilder starts from the full environment of this process.
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }
        cmd
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Returns `$SHELL`, falling back to [`DEFAULT_SHELL`].
pub fn default_shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => DEFAULT_SHELL.to_string(),
    }
}

/// One pty device plus the shell process attached to it.
pub struct PtyBridge {
    /// Raw fd of the pty master.
    id: SessionId,

    /// Process ID of the shell.
    pid: Option<u32>,

    /// The PTY master handle, kept for resizing and to hold the device open.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Reader for shell output, taken by the output copy.
    reader: Mutex<Option<Box<dyn Read + Send>>>,

    /// Writer for shell input.
    writer: Mutex<Box<dyn Write + Send>>,

    /// The child process. Reaping and signalling both happen under this lock.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Where shell output is copied to.
    sink: Arc<dyn RemoteStream>,

    /// Terminal whose mode is switched to raw while the bridge runs.
    terminal: Arc<dyn TerminalControl>,

    /// Mode captured by `make_raw`, consumed by `restore`.
    prior_mode: Mutex<Option<SavedMode>>,

    /// Current window size.
    size: Mutex<WindowSize>,

    /// Set when `run` has been entered.
    running: AtomicBool,

    /// Set when teardown begins. Suppresses resize and raw mode entry.
    stopping: AtomicBool,

    /// Set under the `child` lock once the child has been reaped; its pid
    /// must not be signalled after that.
    exited: AtomicBool,

    /// Exit code of the shell, once known.
    exit_code: Mutex<Option<u32>>,

    teardown: Once,
}

impl PtyBridge {
    /// Allocates a pty, spawns `command` on it and returns the bridge.
    ///
    /// The initial window size is taken from `terminal`. On any failure
    /// nothing is left behind: a spawned child is killed and reaped and the
    /// device is released before the error is returned.
    pub fn start(
        command: &ShellCommand,
        sink: Arc<dyn RemoteStream>,
        terminal: Arc<dyn TerminalControl>,
    ) -> Result<Arc<Self>, SessionError> {
        let size = terminal.window_size()?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(size))
            .map_err(|e| SessionError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| SessionError::Spawn(format!("failed to spawn {}: {e}", command.program)))?;

        // The shell holds its own slave fds; ours would keep the device
        // alive after the shell exits and the output copy would never end.
        drop(pair.slave);

        let (id, reader, writer) = match master_handles(pair.master.as_ref()) {
            Ok(handles) => handles,
            Err(e) => {
                if let Err(kill_err) = child.kill() {
                    tracing::debug!(error = %kill_err, "Failed to kill half-started shell");
                }
                if let Err(wait_err) = child.wait() {
                    tracing::debug!(error = %wait_err, "Failed to reap half-started shell");
                }
                return Err(e);
            }
        };
        let pid = child.process_id();

        tracing::info!(
            session_id = id,
            pid = ?pid,
            program = %command.program,
            rows = size.rows,
            cols = size.cols,
            "PTY spawned"
        );

        Ok(Arc::new(Self {
            id,
            pid,
            master: Mutex::new(pair.master),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            sink,
            terminal,
            prior_mode: Mutex::new(None),
            size: Mutex::new(size),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            teardown: Once::new(),
        }))
    }

    /// Returns the bridge id (the pty master fd).
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current window size.
    pub fn size(&self) -> WindowSize {
        *lock(&self.size)
    }

    /// Returns the shell's exit code once it has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        *lock(&self.exit_code)
    }

    /// Returns true once teardown has completed.
    pub fn is_closed(&self) -> bool {
        self.teardown.is_completed()
    }

    /// Captures the terminal mode and switches the terminal to raw mode.
    ///
    /// Fails if raw mode was already entered by this bridge, since that would
    /// overwrite the mode to restore, or if teardown has begun.
    pub fn make_raw(&self) -> Result<(), SessionError> {
        let mut prior = lock(&self.prior_mode);

        if self.stopping.load(Ordering::SeqCst) {
            return Err(SessionError::TerminalMode(
                "bridge is shutting down".to_string(),
            ));
        }
        if prior.is_some() {
            return Err(SessionError::TerminalMode(
                "raw mode already entered".to_string(),
            ));
        }

        *prior = Some(self.terminal.make_raw()?);
        Ok(())
    }

    /// Writes bytes to the pty. Short writes and errors are returned as is.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut writer = lock(&self.writer);
        let n = writer.write(data)?;
        writer.flush()?;
        Ok(n)
    }

    /// Propagates a new window size to the device.
    ///
    /// Resizing is advisory: failures are logged and dropped, and the call
    /// does nothing once teardown has begun.
    pub fn resize(&self, size: WindowSize) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let master = lock(&self.master);
        match master.resize(to_pty_size(size)) {
            Ok(()) => {
                *lock(&self.size) = size;
                tracing::debug!(
                    session_id = self.id,
                    rows = size.rows,
                    cols = size.cols,
                    "Resized PTY"
                );
            }
            Err(e) => {
                tracing::debug!(session_id = self.id, error = %e, "PTY resize ignored");
            }
        }
    }

    /// Runs the bridge until the shell exits.
    ///
    /// Enters raw mode, starts the output copy on its own thread and blocks
    /// on the child. Teardown runs when the child exits, whatever the reason.
    pub fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(session_id = self.id, "Bridge already running");
            return;
        }
        if self.stopping.load(Ordering::SeqCst) {
            // Teardown may have checked `running` before it was set, so it
            // cannot be relied on to reap the child.
            tracing::debug!(session_id = self.id, "Bridge closed before it ran");
            self.reap();
            return;
        }

        match self.make_raw() {
            Ok(()) => self.start_output_copy(),
            Err(e) => {
                tracing::error!(session_id = self.id, error = %e, "Failed to enter raw mode");
                self.stop_and_restore();
                self.close_sink();
            }
        }

        if let Some(status) = self.reap() {
            tracing::info!(
                session_id = self.id,
                exit_code = status.exit_code(),
                "Shell exited"
            );
        }

        self.stop_and_restore();
    }

    /// Blocks until the shell has exited and reaps it.
    ///
    /// The child lock is only held for each `try_wait`, so `stop` can signal
    /// in between; `exited` is set in the same critical section as the reap.
    /// Safe to call more than once: later calls return the recorded status.
    fn reap(&self) -> Option<ExitStatus> {
        loop {
            {
                let mut child = lock(&self.child);
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.exited.store(true, Ordering::SeqCst);
                        *lock(&self.exit_code) = Some(status.exit_code());
                        return Some(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(session_id = self.id, error = %e, "Failed to wait for shell");
                        return None;
                    }
                }
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    /// Starts the device→sink copy on its own thread.
    fn start_output_copy(self: &Arc<Self>) {
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };

        let bridge = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("tty-{}-output", self.id))
            .spawn(move || bridge.copy_output(reader));

        if let Err(e) = spawned {
            tracing::error!(session_id = self.id, error = %e, "Failed to start output copy");
            self.stop_and_restore();
            self.close_sink();
        }
    }

    /// Copies shell output into the sink until either side gives out.
    fn copy_output(&self, mut reader: Box<dyn Read + Send>) {
        match io::copy(&mut reader, &mut StreamWriter(self.sink.as_ref())) {
            Ok(bytes) => {
                tracing::debug!(session_id = self.id, bytes, "PTY output ended");
            }
            Err(e) => {
                // EIO is how a pty master reports that the shell is gone.
                tracing::debug!(session_id = self.id, error = %e, "PTY output copy stopped");
            }
        }

        self.stop_and_restore();
        self.close_sink();
    }

    /// Closes the remote stream so the session's read loop notices the
    /// bridge is gone.
    fn close_sink(&self) {
        if let Err(e) = self.sink.close() {
            tracing::debug!(session_id = self.id, error = %e, "Failed to close remote stream");
        }
    }

    /// Signals the shell to terminate.
    ///
    /// SIGTERM is followed immediately by SIGKILL, with no grace period and
    /// no wait. Signals are sent under the child lock and skipped once the
    /// child has been reaped. Delivery failures are logged and otherwise
    /// ignored.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let mut child = lock(&self.child);
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let Some(pid) = self.pid else {
            if let Err(e) = child.kill() {
                tracing::debug!(session_id = self.id, error = %e, "Kill not delivered");
            }
            return;
        };
        let pid = Pid::from_raw(pid as i32);

        for signal in [Signal::SIGTERM, Signal::SIGKILL] {
            if let Err(e) = kill(pid, signal) {
                tracing::debug!(session_id = self.id, ?signal, error = %e, "Signal not delivered");
            }
        }
    }

    /// Restores the terminal mode captured by [`PtyBridge::make_raw`].
    ///
    /// Does nothing if raw mode was never entered or was already restored.
    pub fn restore(&self) {
        let saved = lock(&self.prior_mode).take();
        if let Some(saved) = saved {
            if let Err(e) = self.terminal.restore(saved) {
                tracing::warn!(session_id = self.id, error = %e, "Failed to restore terminal");
            }
        }
    }

    /// Stops the shell, then restores the terminal. Runs at most once.
    ///
    /// When [`PtyBridge::run`] has not been entered, nothing else will wait
    /// for the shell, so it is reaped here.
    pub fn stop_and_restore(&self) {
        self.teardown.call_once(|| {
            self.stop();
            if !self.running.load(Ordering::SeqCst) {
                self.reap();
            }
            self.restore();
            tracing::info!(session_id = self.id, "Bridge torn down");
        });
    }
}

impl PtyHandler for PtyBridge {
    fn id(&self) -> SessionId {
        self.id
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        PtyBridge::write(self, data)
    }

    fn run(self: Arc<Self>) {
        PtyBridge::run(self)
    }

    fn resize(&self, size: WindowSize) {
        PtyBridge::resize(self, size)
    }

    fn close(&self) {
        self.stop_and_restore()
    }

    fn is_closed(&self) -> bool {
        PtyBridge::is_closed(self)
    }
}

/// Spawns real [`PtyBridge`]s.
pub struct PtySpawner {
    command: ShellCommand,
    terminal: Arc<dyn TerminalControl>,
}

impl PtySpawner {
    /// Creates a spawner that runs `command` under `terminal`.
    pub fn new(command: ShellCommand, terminal: Arc<dyn TerminalControl>) -> Self {
        Self { command, terminal }
    }

    /// Returns the command new bridges run.
    pub fn command(&self) -> &ShellCommand {
        &self.command
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, sink: Arc<dyn RemoteStream>) -> Result<Arc<dyn PtyHandler>, SessionError> {
        let bridge: Arc<dyn PtyHandler> =
            PtyBridge::start(&self.command, sink, Arc::clone(&self.terminal))?;
        Ok(bridge)
    }
}

/// Queries the master fd and takes the reader and writer of a new pty.
fn master_handles(
    master: &dyn MasterPty,
) -> Result<(SessionId, Box<dyn Read + Send>, Box<dyn Write + Send>), SessionError> {
    let id = master
        .as_raw_fd()
        .ok_or_else(|| SessionError::Spawn("PTY master has no file descriptor".to_string()))?;

    let reader = master
        .try_clone_reader()
        .map_err(|e| SessionError::Spawn(format!("failed to clone PTY reader: {e}")))?;

    let writer = master
        .take_writer()
        .map_err(|e| SessionError::Spawn(format!("failed to take PTY writer: {e}")))?;

    Ok((id, reader, writer))
}

fn to_pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tty::remote::MemoryStream;
    use crate::tty::terminal::DetachedTerminal;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Terminal double that counts raw mode transitions.
    #[derive(Default)]
    pub(crate) struct CountingTerminal {
        pub(crate) raw_calls: AtomicUsize,
        pub(crate) restore_calls: AtomicUsize,
        pub(crate) fail_size: bool,
        pub(crate) fail_raw: bool,
    }

    impl TerminalControl for CountingTerminal {
        fn window_size(&self) -> Result<WindowSize, SessionError> {
            if self.fail_size {
                return Err(SessionError::TerminalSize("not a terminal".to_string()));
            }
            Ok(WindowSize::default())
        }

        fn make_raw(&self) -> Result<SavedMode, SessionError> {
            if self.fail_raw {
                return Err(SessionError::TerminalMode("not a terminal".to_string()));
            }
            self.raw_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SavedMode::none())
        }

        fn restore(&self, _saved: SavedMode) -> Result<(), SessionError> {
            self.restore_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sh() -> ShellCommand {
        ShellCommand::new("/bin/sh")
    }

    fn spawn_bridge(
        terminal: Arc<dyn TerminalControl>,
    ) -> (Arc<PtyBridge>, Arc<MemoryStream>) {
        let (local, peer) = MemoryStream::pair();
        let bridge = PtyBridge::start(&sh(), Arc::new(local), terminal).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(100)));
        (bridge, Arc::new(peer))
    }

    /// Reads from `peer` until `marker` shows up or the deadline passes.
    pub(crate) fn read_until(peer: &dyn RemoteStream, marker: &str, secs: u64) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(secs);

        while Instant::now() < deadline {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(marker) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }

        String::from_utf8_lossy(&output).into_owned()
    }

    pub(crate) fn wait_for(mut condition: impl FnMut() -> bool, secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    #[serial]
    fn test_default_shell_from_env() {
        let saved = std::env::var("SHELL").ok();

        std::env::set_var("SHELL", "/bin/zsh");
        assert_eq!(ShellCommand::from_env().program, "/bin/zsh");

        std::env::remove_var("SHELL");
        assert_eq!(ShellCommand::from_env().program, DEFAULT_SHELL);

        std::env::set_var("SHELL", "");
        assert_eq!(default_shell(), DEFAULT_SHELL);

        match saved {
            Some(shell) => std::env::set_var("SHELL", shell),
            None => std::env::remove_var("SHELL"),
        }
    }

    #[test]
    fn test_start_bridge() {
        let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));

        assert!(bridge.id() >= 0);
        assert!(bridge.pid().is_some());
        assert_eq!(bridge.size(), WindowSize::default());
        assert!(!bridge.is_closed());

        // Clean up
        bridge.stop_and_restore();
    }

    #[test]
    fn test_start_uses_terminal_size() {
        let terminal = DetachedTerminal::new(WindowSize::new(50, 132));
        let (bridge, _peer) = spawn_bridge(Arc::new(terminal));

        assert_eq!(bridge.size(), WindowSize::new(50, 132));

        // Clean up
        bridge.stop_and_restore();
    }

    #[test]
    fn test_start_fails_when_size_unavailable() {
        let terminal = CountingTerminal {
            fail_size: true,
            ..Default::default()
        };
        let (local, _peer) = MemoryStream::pair();

        let result = PtyBridge::start(&sh(), Arc::new(local), Arc::new(terminal));
        assert!(matches!(result, Err(SessionError::TerminalSize(_))));
    }

    #[test]
    fn test_start_fails_for_missing_program() {
        let (local, _peer) = MemoryStream::pair();
        let command = ShellCommand::new("/nonexistent/ttymux-test-shell");

        let result = PtyBridge::start(
            &command,
            Arc::new(local),
            Arc::new(DetachedTerminal::default()),
        );
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }

    #[test]
    fn test_write_reaches_shell() {
        let (bridge, peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
        let runner = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.run())
        };

        bridge.write(b"echo BRIDGE_ECHO_OK\n").unwrap();

        let output = read_until(peer.as_ref(), "BRIDGE_ECHO_OK", 5);
        assert!(
            output.contains("BRIDGE_ECHO_OK"),
            "Expected echoed marker, got: {output}"
        );

        // Clean up
        bridge.stop_and_restore();
        runner.join().unwrap();
    }

    #[test]
    fn test_shell_exit_tears_down_once() {
        let terminal = Arc::new(CountingTerminal::default());
        let (bridge, peer) = spawn_bridge(terminal.clone());
        let runner = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.run())
        };

        bridge.write(b"exit 3\n").unwrap();
        runner.join().unwrap();

        assert!(bridge.is_closed());
        assert_eq!(bridge.exit_code(), Some(3));
        assert_eq!(terminal.raw_calls.load(Ordering::SeqCst), 1);
        assert_eq!(terminal.restore_calls.load(Ordering::SeqCst), 1);

        // The output copy closes the remote once the device reports EOF.
        assert!(wait_for(|| peer.is_peer_closed(), 5));
    }

    #[test]
    fn test_concurrent_teardown_is_idempotent() {
        let terminal = Arc::new(CountingTerminal::default());
        let (bridge, _peer) = spawn_bridge(terminal.clone());
        let runner = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.run())
        };
        assert!(wait_for(|| terminal.raw_calls.load(Ordering::SeqCst) == 1, 5));

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || bridge.stop_and_restore())
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }
        runner.join().unwrap();

        assert!(bridge.is_closed());
        assert_eq!(terminal.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_before_run() {
        let terminal = Arc::new(CountingTerminal::default());
        let (bridge, _peer) = spawn_bridge(terminal.clone());

        bridge.stop_and_restore();
        Arc::clone(&bridge).run();

        assert!(bridge.is_closed());
        assert!(bridge.exit_code().is_some());
        assert_eq!(terminal.raw_calls.load(Ordering::SeqCst), 0);
        assert_eq!(terminal.restore_calls.load(Ordering::SeqCst), 0);
    }

    /// Returns true while `/proc` still lists the process, zombies included.
    fn process_exists(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[test]
    fn test_close_without_run_reaps_shell() {
        let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
        let pid = bridge.pid().unwrap();
        assert!(process_exists(pid));

        // Nobody ever calls run; teardown alone must collect the shell.
        bridge.stop_and_restore();

        assert!(bridge.is_closed());
        assert!(bridge.exit_code().is_some());
        assert!(!process_exists(pid));
    }

    #[test]
    fn test_close_racing_run_reaps_shell() {
        for _ in 0..5 {
            let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
            let pid = bridge.pid().unwrap();

            let runner = {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || bridge.run())
            };
            bridge.stop_and_restore();
            runner.join().unwrap();

            assert!(bridge.exit_code().is_some());
            assert!(!process_exists(pid));
        }
    }

    #[test]
    fn test_stop_after_exit_keeps_status() {
        let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
        let runner = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.run())
        };

        bridge.write(b"exit 7\n").unwrap();
        runner.join().unwrap();
        assert_eq!(bridge.exit_code(), Some(7));

        // The pid is already reaped; stopping again must not touch it.
        bridge.stop();
        bridge.stop_and_restore();
        assert_eq!(bridge.exit_code(), Some(7));
        assert!(bridge.is_closed());
    }

    #[test]
    fn test_make_raw_twice_fails() {
        let terminal = Arc::new(CountingTerminal::default());
        let (bridge, _peer) = spawn_bridge(terminal.clone());

        bridge.make_raw().unwrap();
        let second = bridge.make_raw();
        assert!(matches!(second, Err(SessionError::TerminalMode(_))));
        assert_eq!(terminal.raw_calls.load(Ordering::SeqCst), 1);

        bridge.stop_and_restore();
        assert_eq!(terminal.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raw_mode_failure_stops_shell() {
        let terminal = Arc::new(CountingTerminal {
            fail_raw: true,
            ..Default::default()
        });
        let (bridge, _peer) = spawn_bridge(terminal.clone());

        Arc::clone(&bridge).run();

        assert!(bridge.is_closed());
        assert_eq!(terminal.restore_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resize() {
        let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));

        bridge.resize(WindowSize::new(40, 120));
        assert_eq!(bridge.size(), WindowSize::new(40, 120));

        // Clean up
        bridge.stop_and_restore();
    }

    #[test]
    fn test_resize_after_teardown_is_ignored() {
        let (bridge, _peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
        bridge.stop_and_restore();

        bridge.resize(WindowSize::new(40, 120));
        assert_eq!(bridge.size(), WindowSize::default());
    }

    #[test]
    fn test_remote_gone_stops_output_copy() {
        let (bridge, peer) = spawn_bridge(Arc::new(DetachedTerminal::default()));
        let runner = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.run())
        };

        // With the remote gone, the next chunk of output fails to copy and
        // the bridge tears itself down.
        peer.close().unwrap();
        bridge.write(b"echo trigger output\n").unwrap();

        runner.join().unwrap();
        assert!(bridge.is_closed());
    }
}
