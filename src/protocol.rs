//! The wire protocol spoken over a session's Unix socket.
//!
//! Control frames are newline-terminated ASCII lines, classified by
//! exact match against each whole read chunk; anything else is opaque
//! terminal data. The client side keeps every control frame in its own
//! socket write so the supervisor's classifier never sees a control
//! token embedded in a data chunk.

use std::{
    io,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    thread,
    time::Instant,
};

use anyhow::Context;
use tracing::info;

use super::{consts, error::SessError};

pub const READY: &[u8] = b"READY\n";
pub const PONG: &[u8] = b"PONG\n";
pub const DISCONNECT: &[u8] = b"DISCONNECT\n";
pub const PING: &[u8] = b"PING\n";
pub const RESIZE_PREFIX: &[u8] = b"RESIZE ";
pub const ERROR_PREFIX: &[u8] = b"ERROR: ";

/// What the supervisor makes of one read chunk from the client.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'data> {
    Disconnect,
    Ping,
    Resize { rows: u16, cols: u16 },
    /// Not a control frame; forward verbatim to the pty.
    Data(&'data [u8]),
}

impl<'data> Frame<'data> {
    /// Classify a whole read chunk. Deliberately a three-branch exact
    /// compare rather than a streaming decoder: a chunk that mixes a
    /// control line with other bytes is data.
    pub fn classify(chunk: &'data [u8]) -> Frame<'data> {
        if chunk == DISCONNECT {
            return Frame::Disconnect;
        }
        if chunk == PING {
            return Frame::Ping;
        }
        if let Some(size) = parse_resize(chunk) {
            return Frame::Resize { rows: size.0, cols: size.1 };
        }
        Frame::Data(chunk)
    }
}

/// `RESIZE <rows> <cols>\n` with both fields decimal non-negative
/// integers, nothing else in the chunk.
fn parse_resize(chunk: &[u8]) -> Option<(u16, u16)> {
    let rest = chunk.strip_prefix(RESIZE_PREFIX)?;
    let rest = rest.strip_suffix(b"\n")?;
    let rest = std::str::from_utf8(rest).ok()?;

    let mut parts = rest.split(' ');
    let rows = parts.next()?.parse::<u16>().ok()?;
    let cols = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((rows, cols))
}

pub fn resize_frame(rows: u16, cols: u16) -> Vec<u8> {
    format!("RESIZE {rows} {cols}\n").into_bytes()
}

/// A dialed connection to a session supervisor.
pub struct Client {
    pub stream: UnixStream,
}

impl Client {
    /// Dial the supervisor socket, retrying until the connect deadline.
    /// The socket file can lag the supervisor's startup slightly, so
    /// refusals and absence are both retried.
    pub fn dial<P: AsRef<Path>>(sock: P) -> anyhow::Result<Client> {
        let sock = sock.as_ref();
        let deadline = Instant::now() + consts::CONNECT_TIMEOUT;
        loop {
            match UnixStream::connect(sock) {
                Ok(stream) => return Ok(Client { stream }),
                Err(e) => {
                    if Instant::now() >= deadline {
                        info!("giving up dialing {:?}: {:?}", sock, e);
                        return Err(SessError::Timeout("connecting to session").into());
                    }
                }
            }
            thread::sleep(consts::CONNECT_POLL_DUR);
        }
    }

    /// Read the greeting line. `READY\n` means we own the attachment
    /// slot; an `ERROR: ...` line means the supervisor turned us away.
    pub fn read_greeting(&mut self, session_id: &str) -> anyhow::Result<()> {
        self.stream
            .set_read_timeout(Some(consts::GREETING_TIMEOUT))
            .context("setting greeting read deadline")?;

        let mut buf = [0u8; 256];
        let n = match self.stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(SessError::Timeout("reading session greeting").into());
            }
            Err(e) => return Err(e).context("reading session greeting"),
        };
        let greeting = &buf[..n];

        self.stream.set_read_timeout(None).context("clearing greeting read deadline")?;

        if greeting == READY {
            return Ok(());
        }
        if greeting.starts_with(ERROR_PREFIX) {
            let msg = String::from_utf8_lossy(&greeting[ERROR_PREFIX.len()..]);
            let msg = msg.trim();
            if msg.contains("busy") {
                return Err(SessError::AlreadyAttached(String::from(session_id)).into());
            }
            return Err(SessError::ConnectionFailed(String::from(msg)).into());
        }
        Err(SessError::ConnectionFailed(format!(
            "unexpected greeting: {}",
            String::from_utf8_lossy(greeting)
        ))
        .into())
    }

    pub fn try_clone(&self) -> anyhow::Result<Client> {
        Ok(Client { stream: self.stream.try_clone().context("cloning client stream")? })
    }

    // Control frames must each be a lone write so the supervisor's
    // exact-match classifier recognizes them.

    pub fn send_detach(&mut self) -> std::io::Result<()> {
        self.stream.write_all(DISCONNECT)
    }

    pub fn send_ping(&mut self) -> std::io::Result<()> {
        self.stream.write_all(PING)
    }

    pub fn send_resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()> {
        self.stream.write_all(&resize_frame(rows, cols))
    }

    pub fn send_input(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }
}
