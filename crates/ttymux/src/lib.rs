//! # ttymux
//!
//! This crate connects remote byte streams to interactive shells running
//! inside pseudo-terminals on the local host.
//!
//! ## Overview
//!
//! Every remote connection becomes a session. A session owns one pty device
//! with a shell attached to it and copies bytes in both directions until
//! either side goes away:
//!
//! - **Sessions**: pair a remote stream with a bridge and forward input
//! - **Bridges**: own the pty, the shell process and terminal mode
//! - **Registry**: track live sessions by id, start, resize and close them
//! - **Daemon**: accept TCP clients and turn each into a session (`ttymuxd`)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SessionManager                         │
//! │               DashMap<SessionId, Arc<Session>>                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   remote ──read──▶ Session ──write──▶ PtyBridge ──▶ pty ──▶ shell
//! │   remote ◀──────────────── output copy ◀────────── pty ◀── shell
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Teardown runs exactly once per bridge, whichever side finishes first:
//! the shell is signalled, the terminal mode restored, and the remote stream
//! closed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! use ttymux::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let manager = config.session_manager();
//!
//!     let listener = TcpListener::bind(config.listen_addr()?)?;
//!     for stream in listener.incoming() {
//!         let id = manager.create_session(Arc::new(stream?))?;
//!         manager.start_session(id)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod tty;

pub use config::{Config, ConfigError, TerminalMode};
pub use tty::{
    DetachedTerminal, HostTerminal, MemoryStream, PtyBridge, PtyHandler, PtySpawner,
    RemoteStream, Session, SessionError, SessionId, SessionManager, SessionState, ShellCommand,
    Spawner, TerminalControl, WindowSize,
};
