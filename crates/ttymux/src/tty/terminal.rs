//! Host terminal control.
//!
//! A bridge needs two things from the terminal it runs under: the window size
//! used for a new pty, and the ability to switch into raw mode and back.
//!
//! Raw mode is process-wide state. [`HostTerminal`] is the single owner of
//! the process's standard input terminal: the first bridge to enter raw mode
//! captures the cooked settings, later bridges only nest, and the last one to
//! restore puts the captured settings back. Processes without a controlling
//! terminal (daemons, tests) use [`DetachedTerminal`] instead.

use std::io;
use std::os::fd::AsFd;
use std::sync::Mutex;

use nix::sys::termios::{self, SetArg, Termios};
use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::lock;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Terminal settings captured before entering raw mode.
///
/// Handed back to [`TerminalControl::restore`] exactly once.
#[derive(Debug, Clone, Default)]
pub struct SavedMode {
    termios: Option<Termios>,
}

impl SavedMode {
    /// A saved mode with nothing to restore.
    pub fn none() -> Self {
        Self { termios: None }
    }

    /// Returns true if real terminal settings were captured.
    pub fn is_captured(&self) -> bool {
        self.termios.is_some()
    }
}

/// Control over the terminal a bridge runs under.
pub trait TerminalControl: Send + Sync {
    /// Returns the current window size.
    fn window_size(&self) -> Result<WindowSize, SessionError>;

    /// Captures the current mode and switches the terminal into raw mode.
    fn make_raw(&self) -> Result<SavedMode, SessionError>;

    /// Restores a mode returned by [`TerminalControl::make_raw`].
    fn restore(&self, saved: SavedMode) -> Result<(), SessionError>;
}

/// The process's own terminal (standard input).
#[derive(Debug, Default)]
pub struct HostTerminal {
    state: Mutex<HostState>,
}

#[derive(Debug, Default)]
struct HostState {
    /// Number of bridges currently holding raw mode.
    depth: usize,
    /// Settings in effect before the outermost bridge went raw.
    original: Option<Termios>,
}

impl HostTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bridges currently holding the terminal in raw mode.
    pub fn raw_depth(&self) -> usize {
        lock(&self.state).depth
    }
}

impl TerminalControl for HostTerminal {
    fn window_size(&self) -> Result<WindowSize, SessionError> {
        let (cols, rows) = crossterm::terminal::size()
            .map_err(|e| SessionError::TerminalSize(e.to_string()))?;
        Ok(WindowSize { rows, cols })
    }

    fn make_raw(&self) -> Result<SavedMode, SessionError> {
        let mut state = lock(&self.state);

        if state.depth == 0 {
            let stdin = io::stdin();
            let original = termios::tcgetattr(stdin.as_fd())
                .map_err(|e| SessionError::TerminalMode(format!("tcgetattr: {e}")))?;

            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
                .map_err(|e| SessionError::TerminalMode(format!("tcsetattr: {e}")))?;

            state.original = Some(original);
            tracing::debug!("Host terminal switched to raw mode");
        }

        state.depth += 1;
        Ok(SavedMode {
            termios: state.original.clone(),
        })
    }

    fn restore(&self, saved: SavedMode) -> Result<(), SessionError> {
        let mut state = lock(&self.state);

        if state.depth == 0 {
            return Err(SessionError::TerminalMode(
                "terminal is not in raw mode".to_string(),
            ));
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(());
        }

        let original = state.original.take().or(saved.termios);
        if let Some(original) = original {
            let stdin = io::stdin();
            termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &original)
                .map_err(|e| SessionError::TerminalMode(format!("tcsetattr: {e}")))?;
            tracing::debug!("Host terminal restored");
        }
        Ok(())
    }
}

/// A terminal that is not there.
///
/// Reports a fixed window size; raw mode transitions succeed without
/// touching anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedTerminal {
    size: WindowSize,
}

impl DetachedTerminal {
    pub fn new(size: WindowSize) -> Self {
        Self { size }
    }
}

impl TerminalControl for DetachedTerminal {
    fn window_size(&self) -> Result<WindowSize, SessionError> {
        Ok(self.size)
    }

    fn make_raw(&self) -> Result<SavedMode, SessionError> {
        Ok(SavedMode::none())
    }

    fn restore(&self, _saved: SavedMode) -> Result<(), SessionError> {
        Ok(())
    }
}
