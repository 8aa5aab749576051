use std::{
    collections::HashMap,
    io::{Read, Write},
    net,
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error, info, trace};

use super::shell::Shell;
use crate::{consts, protocol, tty};

const PIPE_POLL_MILLIS: u64 = 100;
const PIPE_POLL_DURATION_TIMEVAL: nix::sys::time::TimeVal =
    nix::sys::time::TimeVal::new(0, 1000 * (PIPE_POLL_MILLIS as nix::sys::time::suseconds_t));

/// The socket server half of a session supervisor: owns the client
/// table and shuffles bytes between the one attached client and the
/// pty.
pub struct Server {
    session_id: String,
    pub(crate) shell: Shell,
    /// The attachment slot. A map for bookkeeping convenience, but the
    /// accept path never lets it grow beyond one entry.
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_conn_id: AtomicU64,
    stop: Arc<AtomicBool>,
}

struct ClientHandle {
    /// Writes from the pty broadcast and the PONG reply path are
    /// serialized through this mutex so they can't interleave.
    stream: Mutex<UnixStream>,
    last_activity: Mutex<Instant>,
}

impl Server {
    pub fn new(session_id: String, shell: Shell, stop: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Server {
            session_id,
            shell,
            clients: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            stop,
        })
    }

    /// Run the accept loop, the pty output loop, and the idle monitor
    /// until the stop latch closes, then drop every client.
    pub fn serve(server: &Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        listener.set_nonblocking(true).context("setting listener nonblocking")?;

        thread::scope(|s| {
            let accept_h = s.spawn(|| server.accept_loop(&listener));
            let pty_h = s.spawn(|| server.pty_loop());
            let monitor_h = s.spawn(|| server.monitor_loop());

            loop {
                if server.stopping()
                    || accept_h.is_finished()
                    || pty_h.is_finished()
                    || monitor_h.is_finished()
                {
                    server.stop.store(true, Ordering::Relaxed);
                    break;
                }
                thread::sleep(consts::JOIN_POLL_DUR);
            }

            for (name, handle) in
                [("accept", accept_h), ("pty", pty_h), ("monitor", monitor_h)]
            {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("s({}): {} loop: {:?}", server.session_id, name, e),
                    Err(panic_err) => std::panic::resume_unwind(panic_err),
                }
            }
        });

        server.remove_all_clients();
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn accept_loop(self: &Arc<Self>, listener: &UnixListener) -> anyhow::Result<()> {
        info!("s({}): listening", self.session_id);
        loop {
            if self.stopping() {
                return Ok(());
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    info!("s({}): socket got a new connection", self.session_id);
                    self.handle_accept(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(consts::ACCEPT_POLL_DUR);
                }
                Err(e) => {
                    error!("s({}): accepting stream: {:?}", self.session_id, e);
                    thread::sleep(consts::ACCEPT_POLL_DUR);
                }
            }
        }
    }

    /// Enforce the single-client invariant right here at the accept
    /// site: a second connection gets one error line and a close,
    /// before any READY.
    fn handle_accept(self: &Arc<Self>, stream: UnixStream) {
        if let Err(e) = stream.set_write_timeout(Some(consts::SOCK_WRITE_TIMEOUT)) {
            error!("s({}): setting write deadline: {:?}", self.session_id, e);
            return;
        }

        let mut clients = self.clients.write().unwrap();
        if !clients.is_empty() {
            info!("s({}): rejecting second attach", self.session_id);
            let _ = (&stream).write_all(b"ERROR: session busy\n");
            let _ = stream.shutdown(net::Shutdown::Both);
            return;
        }

        // short read deadline so the connection reader can observe
        // cancellation; clones share the underlying socket options
        if let Err(e) = stream.set_read_timeout(Some(consts::SOCK_READ_TIMEOUT)) {
            error!("s({}): setting read deadline: {:?}", self.session_id, e);
            return;
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!("s({}): cloning client stream: {:?}", self.session_id, e);
                return;
            }
        };
        if let Err(e) = (&stream).write_all(protocol::READY) {
            info!("s({}): writing READY: {:?}", self.session_id, e);
            let _ = stream.shutdown(net::Shutdown::Both);
            return;
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        clients.insert(
            conn_id,
            ClientHandle {
                stream: Mutex::new(stream),
                last_activity: Mutex::new(Instant::now()),
            },
        );
        drop(clients);

        info!("s({}): client {} attached", self.session_id, conn_id);
        let server = Arc::clone(self);
        thread::spawn(move || {
            if let Err(e) = server.handle_conn(conn_id, reader_stream) {
                error!("s({}): conn {}: {:?}", server.session_id, conn_id, e);
            }
        });
    }

    /// Per-connection reader. Classifies each whole read chunk with an
    /// exact match; control framing and raw data are never multiplexed
    /// within one chunk, the client sends control frames as isolated
    /// writes.
    fn handle_conn(&self, conn_id: u64, mut stream: UnixStream) -> anyhow::Result<()> {
        let mut master = self.shell.master()?;
        let mut buf = vec![0; consts::BUF_SIZE];

        loop {
            if self.stopping() {
                return Ok(());
            }

            let len = match stream.read(&mut buf) {
                Ok(0) => {
                    info!("s({}): conn {}: client hung up", self.session_id, conn_id);
                    self.remove_client(conn_id);
                    return Ok(());
                }
                Ok(l) => l,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    info!("s({}): conn {}: read error: {:?}", self.session_id, conn_id, e);
                    self.remove_client(conn_id);
                    return Ok(());
                }
            };

            self.touch(conn_id);

            match protocol::Frame::classify(&buf[..len]) {
                protocol::Frame::Disconnect => {
                    info!("s({}): conn {}: detach requested", self.session_id, conn_id);
                    self.remove_client(conn_id);
                    return Ok(());
                }
                protocol::Frame::Ping => {
                    trace!("s({}): conn {}: ping", self.session_id, conn_id);
                    self.reply_pong(conn_id);
                }
                protocol::Frame::Resize { rows, cols } => {
                    if let Err(e) = self.apply_resize(rows, cols) {
                        info!("s({}): applying resize: {:?}", self.session_id, e);
                    }
                }
                protocol::Frame::Data(bytes) => {
                    if let Err(e) = self.write_to_pty(&mut master, bytes) {
                        // a dead pty is session-fatal; the SIGCHLD
                        // path closes the latch right behind this
                        info!("s({}): writing input to pty: {:?}", self.session_id, e);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Apply a new window size to the pty (master and slave share the
    /// one kernel size object) and nudge the shell's process group so
    /// interactive programs repaint.
    fn apply_resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        let size = tty::Size { rows, cols };
        let master_fd = self.shell.master_fd()?;
        size.apply(master_fd)?;
        self.shell.signal_winch()?;

        let applied = tty::Size::query(master_fd)?;
        info!("s({}): resized to {:?}, pty reports {:?}", self.session_id, size, applied);
        Ok(())
    }

    fn write_to_pty(
        &self,
        master: &mut shpool_pty::fork::Master,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        let mut to_write = bytes;
        while !to_write.is_empty() {
            if self.stopping() {
                return Ok(());
            }
            let nwritten = match master.write(to_write) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!("client->shell: write: WouldBlock");
                    thread::sleep(consts::PIPE_POLL_DUR);
                    continue;
                }
                Err(e) => return Err(e).context("writing client chunk to pty"),
            };
            debug!("client->shell: wrote {} bytes", nwritten);
            to_write = &to_write[nwritten..];
        }
        master.flush().context("flushing input to pty")?;
        Ok(())
    }

    /// Read the pty master and broadcast whatever the shell produced
    /// to the attached client. Exits (closing the latch) when the
    /// master goes away, which is how shell exit reaches us fastest.
    fn pty_loop(&self) -> anyhow::Result<()> {
        let mut master = self.shell.master()?;
        let master_fd = self.shell.master_fd()?;
        let mut buf = vec![0; consts::BUF_SIZE];

        info!("s({}): shell->client: spawned", self.session_id);
        loop {
            if self.stopping() {
                return Ok(());
            }

            // select so we know when to wake up without burning cpu,
            // bounded so we still observe cancellation
            let mut fdset = nix::sys::select::FdSet::new();
            fdset.insert(master_fd);
            let mut poll_dur = PIPE_POLL_DURATION_TIMEVAL;
            let nready = match nix::sys::select::select(
                None,
                Some(&mut fdset),
                None,
                None,
                Some(&mut poll_dur),
            ) {
                Ok(n) => n,
                Err(nix::errno::Errno::EBADF) => {
                    info!("s({}): shell->client: shell went down", self.session_id);
                    self.stop.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("selecting on pty master"),
            };
            if nready == 0 || !fdset.contains(master_fd) {
                continue;
            }

            let len = match master.read(&mut buf) {
                Ok(0) => {
                    trace!("s({}): shell->client: 0 bytes, waiting", self.session_id);
                    thread::sleep(consts::PIPE_POLL_DUR);
                    continue;
                }
                Ok(l) => l,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(consts::PIPE_POLL_DUR);
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    // master reports EIO once the slave side is gone
                    info!("s({}): shell->client: pty master closed", self.session_id);
                    self.stop.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => return Err(e).context("reading pty master chunk"),
            };

            debug!("s({}): shell->client: read {} pty bytes", self.session_id, len);
            self.broadcast(&buf[..len]);
        }
    }

    fn broadcast(&self, bytes: &[u8]) {
        let mut failed = vec![];
        {
            let clients = self.clients.read().unwrap();
            for (conn_id, handle) in clients.iter() {
                let mut stream = handle.stream.lock().unwrap();
                match stream.write_all(bytes).and_then(|_| stream.flush()) {
                    Ok(()) => {
                        *handle.last_activity.lock().unwrap() = Instant::now();
                    }
                    Err(e) => {
                        info!(
                            "s({}): conn {}: write failed, demoting: {:?}",
                            self.session_id, conn_id, e
                        );
                        failed.push(*conn_id);
                    }
                }
            }
        }
        for conn_id in failed {
            self.remove_client(conn_id);
        }
    }

    fn reply_pong(&self, conn_id: u64) {
        let mut failed = false;
        {
            let clients = self.clients.read().unwrap();
            if let Some(handle) = clients.get(&conn_id) {
                let mut stream = handle.stream.lock().unwrap();
                if let Err(e) = stream.write_all(protocol::PONG) {
                    info!("s({}): conn {}: pong failed: {:?}", self.session_id, conn_id, e);
                    failed = true;
                }
            }
        }
        if failed {
            self.remove_client(conn_id);
        }
    }

    /// Defensive sweep of clients that have gone quiet past the idle
    /// bound. The attached client's keepalive pings mean only dead
    /// peers ever trip this.
    fn monitor_loop(&self) -> anyhow::Result<()> {
        loop {
            let mut slept = Duration::ZERO;
            while slept < consts::MONITOR_SWEEP_DUR {
                if self.stopping() {
                    return Ok(());
                }
                thread::sleep(consts::JOIN_POLL_DUR);
                slept += consts::JOIN_POLL_DUR;
            }

            let now = Instant::now();
            let stale: Vec<u64> = {
                let clients = self.clients.read().unwrap();
                clients
                    .iter()
                    .filter(|(_, handle)| {
                        now.duration_since(*handle.last_activity.lock().unwrap())
                            > consts::CLIENT_IDLE_TIMEOUT
                    })
                    .map(|(conn_id, _)| *conn_id)
                    .collect()
            };
            for conn_id in stale {
                info!("s({}): conn {}: idle past bound, sweeping", self.session_id, conn_id);
                self.remove_client(conn_id);
            }
        }
    }

    fn touch(&self, conn_id: u64) {
        let clients = self.clients.read().unwrap();
        if let Some(handle) = clients.get(&conn_id) {
            *handle.last_activity.lock().unwrap() = Instant::now();
        }
    }

    fn remove_client(&self, conn_id: u64) {
        let mut clients = self.clients.write().unwrap();
        if let Some(handle) = clients.remove(&conn_id) {
            let stream = handle.stream.lock().unwrap();
            let _ = stream.shutdown(net::Shutdown::Both);
            info!("s({}): conn {}: removed", self.session_id, conn_id);
        }
    }

    fn remove_all_clients(&self) {
        let mut clients = self.clients.write().unwrap();
        for (conn_id, handle) in clients.drain() {
            let stream = handle.stream.lock().unwrap();
            let _ = stream.shutdown(net::Shutdown::Both);
            info!("s({}): conn {}: closed at shutdown", self.session_id, conn_id);
        }
    }
}
