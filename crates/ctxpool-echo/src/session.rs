// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-connection state and the one-step line echo protocol.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use ctxpool::{Connection, ContextState};
use parking_lot::Mutex;
use tracing::debug;

/// Longest line we buffer before dropping the connection.
const MAX_LINE: usize = 4096;

pub struct Session {
    stream: Mutex<Option<TcpStream>>,
    fd: AtomicI32,
    last: Mutex<Instant>,
    pending: Mutex<Vec<u8>>,
}

/// What the worker should do with the context after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait for more input.
    Poll,
    /// Complete lines are still buffered; turn again right away.
    Again,
    /// Connection finished; return the context to free.
    Close,
}

impl Next {
    pub fn target(self) -> ContextState {
        match self {
            Next::Poll | Next::Again => ContextState::Polling,
            Next::Close => ContextState::Free,
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
            fd: AtomicI32::new(-1),
            last: Mutex::new(Instant::now()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Bind a freshly accepted stream to this (free) context.
    pub fn attach(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        self.fd.store(stream.as_raw_fd(), Ordering::Release);
        *self.stream.lock() = Some(stream);
        self.pending.lock().clear();
        *self.last.lock() = Instant::now();
        Ok(())
    }

    /// Drop the stream. Closing the socket also removes it from epoll.
    pub fn detach(&self) {
        self.fd.store(-1, Ordering::Release);
        self.stream.lock().take();
        self.pending.lock().clear();
    }

    /// Run one protocol step: drain readable input, answer at most one
    /// line, and decide where the context goes next.
    pub fn step(&self, timeout: Duration) -> Next {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Next::Close;
        };
        let mut pending = self.pending.lock();

        match drain(stream, &mut pending) {
            Ok(Drained::Eof) => return Next::Close,
            Ok(Drained::Data) => *self.last.lock() = Instant::now(),
            Ok(Drained::Nothing) => {
                if self.last.lock().elapsed() >= timeout {
                    debug!(fd = stream.as_raw_fd(), "closing idle connection");
                    let _ = stream.write_all(b"timeout\r\n");
                    return Next::Close;
                }
            }
            Err(err) => {
                debug!(error = %err, "read failed");
                return Next::Close;
            }
        }

        let Some(end) = pending.iter().position(|&b| b == b'\n') else {
            return if pending.len() > MAX_LINE {
                Next::Close
            } else {
                Next::Poll
            };
        };
        let line: Vec<u8> = pending.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);

        if text.eq_ignore_ascii_case("quit") {
            let _ = stream.write_all(b"bye\r\n");
            return Next::Close;
        }
        let reply = format!("{}\r\n", text);
        if let Err(err) = stream.write_all(reply.as_bytes()) {
            debug!(error = %err, "write failed");
            return Next::Close;
        }

        if pending.contains(&b'\n') {
            Next::Again
        } else {
            Next::Poll
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for Session {
    fn socket(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn last_activity(&self) -> Instant {
        *self.last.lock()
    }
}

enum Drained {
    Data,
    Nothing,
    Eof,
}

/// Edge-triggered readiness: read until the socket would block.
fn drain(stream: &mut TcpStream, pending: &mut Vec<u8>) -> io::Result<Drained> {
    let mut buf = [0u8; 1024];
    let mut got = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(Drained::Eof),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                got = true;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(if got { Drained::Data } else { Drained::Nothing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;

    fn connected() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let session = Session::new();
        session.attach(server).unwrap();
        (session, client)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn echoes_one_line_per_step() {
        let (session, mut client) = connected();
        client.write_all(b"hello\r\nworld\r\n").unwrap();
        settle();

        assert_eq!(session.step(Duration::from_secs(60)), Next::Again);
        assert_eq!(session.step(Duration::from_secs(60)), Next::Poll);

        let mut reader = io::BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "hello\r\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "world\r\n");
    }

    #[test]
    fn partial_line_waits_for_more() {
        let (session, mut client) = connected();
        client.write_all(b"hel").unwrap();
        settle();
        assert_eq!(session.step(Duration::from_secs(60)), Next::Poll);
        client.write_all(b"lo\n").unwrap();
        settle();
        assert_eq!(session.step(Duration::from_secs(60)), Next::Poll);
    }

    #[test]
    fn quit_and_eof_close() {
        let (session, mut client) = connected();
        client.write_all(b"QUIT\r\n").unwrap();
        settle();
        assert_eq!(session.step(Duration::from_secs(60)), Next::Close);

        let (session, client) = connected();
        drop(client);
        settle();
        assert_eq!(session.step(Duration::from_secs(60)), Next::Close);
    }

    #[test]
    fn silent_connection_times_out() {
        let (session, _client) = connected();
        assert_eq!(session.step(Duration::ZERO), Next::Close);
    }

    #[test]
    fn detached_session_has_no_socket() {
        let (session, _client) = connected();
        assert!(session.socket() >= 0);
        session.detach();
        assert_eq!(session.socket(), -1);
        assert_eq!(session.step(Duration::from_secs(60)), Next::Close);
        assert_eq!(Next::Close.target(), ContextState::Free);
    }
}
