//! Remote byte streams.
//!
//! A session only needs three things from its remote side: read, write and
//! close. [`RemoteStream`] captures that triad with `&self` receivers so one
//! stream can be read by the session's input loop while the bridge's output
//! copy writes into it from another thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::lock;

/// A bidirectional byte stream connected to a remote peer.
///
/// Reads return `Ok(0)` once the peer has finished sending. `close` must
/// unblock a read that is in progress on another thread.
pub trait RemoteStream: Send + Sync + 'static {
    /// Reads bytes sent by the remote peer.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes bytes to the remote peer.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Closes the stream in both directions.
    fn close(&self) -> io::Result<()>;
}

impl RemoteStream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, data)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl RemoteStream for UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, data)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Adapts a [`RemoteStream`] to [`std::io::Write`] so it can be the target
/// of `io::copy`.
pub(crate) struct StreamWriter<'a>(pub(crate) &'a dyn RemoteStream);

impl Write for StreamWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One direction of a [`MemoryStream`] pair.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    /// The writing end closed; readers drain `buf` and then see EOF.
    write_closed: bool,
    /// The reading end closed; reads and writes stop immediately.
    read_closed: bool,
}

/// In-process duplex stream.
///
/// [`MemoryStream::pair`] returns two connected ends: bytes written to one
/// are read from the other. Closing (or dropping) an end behaves like a
/// socket shutdown: the peer drains what was already sent and then reads
/// EOF, while writes towards the closed end fail with `BrokenPipe`.
pub struct MemoryStream {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    read_timeout: Mutex<Option<Duration>>,
}

impl MemoryStream {
    /// Creates two connected stream ends.
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());

        let a = MemoryStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
            read_timeout: Mutex::new(None),
        };
        let b = MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
            read_timeout: Mutex::new(None),
        };
        (a, b)
    }

    /// Sets a timeout for blocking reads.
    ///
    /// A read that times out fails with `ErrorKind::WouldBlock`, matching
    /// socket behaviour on Unix.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *lock(&self.read_timeout) = timeout;
    }

    /// Returns true once this end has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.incoming.state).read_closed
    }

    /// Returns true once the peer has closed its end.
    pub fn is_peer_closed(&self) -> bool {
        lock(&self.incoming.state).write_closed
    }
}

impl RemoteStream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = *lock(&self.read_timeout);
        let mut state = lock(&self.incoming.state);

        loop {
            if state.read_closed {
                return Ok(0);
            }
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }

            state = match timeout {
                Some(timeout) => {
                    let (guard, result) = self
                        .incoming
                        .ready
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if result.timed_out() && guard.buf.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            "memory stream read timed out",
                        ));
                    }
                    guard
                }
                None => self
                    .incoming
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.outgoing.state);
        if state.write_closed || state.read_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory stream closed",
            ));
        }
        state.buf.extend(data);
        self.outgoing.ready.notify_all();
        Ok(data.len())
    }

    fn close(&self) -> io::Result<()> {
        {
            let mut state = lock(&self.outgoing.state);
            state.write_closed = true;
            self.outgoing.ready.notify_all();
        }
        let mut state = lock(&self.incoming.state);
        state.read_closed = true;
        self.incoming.ready.notify_all();
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let _ = RemoteStream::close(self);
    }
}
