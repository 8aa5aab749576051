use std::{
    io,
    io::{Read, Write},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Instant,
};

use anyhow::{anyhow, Context};
use signal_hook::{
    consts::{SIGINT, SIGTERM, SIGUSR1, SIGWINCH},
    iterator::Signals,
};
use tracing::{error, info, trace};

use super::{consts, protocol, registry, registry::Registry, tty};

/// Attach the invoking terminal to an existing session.
pub fn run(reg: &Registry, id: &str, disable_ctrl_x: bool) -> anyhow::Result<()> {
    let id = registry::normalize_id(id);

    // Refuse self-attach: connecting a session's own shell back to its
    // supervisor would just feed the pty to itself.
    if let Some(current) = registry::current_session_from_env() {
        if registry::normalize_id(&current) == id {
            return Err(anyhow!("cannot attach to session {id} from within itself"));
        }
    }

    reg.lookup(&id)?;
    attach_to(reg, &id, disable_ctrl_x)
}

/// The core attach loop. Assumes the session's socket is (or is about
/// to be) present; the launcher uses this directly after spawning a
/// supervisor.
pub fn attach_to(reg: &Registry, id: &str, disable_ctrl_x: bool) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING ATTACH ============================\n\n");

    let mut client = protocol::Client::dial(reg.socket_path(id))?;
    client.read_greeting(id)?;

    // refuses with an error when stdin has no terminal
    let raw_guard = tty::enter_raw_mode()?;
    tty::set_nonblocking(0, true).context("setting stdin nonblocking")?;

    // tell the supervisor our size right away so the shell lays out
    // correctly before the first byte of output
    let size = tty::Size::query(0).context("fetching terminal size")?;
    client.send_resize(size.rows, size.cols).context("sending initial resize")?;

    client
        .stream
        .set_read_timeout(Some(consts::SOCK_READ_TIMEOUT))
        .context("setting socket read deadline")?;

    reg.set_current(id, process::id() as i32)
        .context("recording current attachment")?;

    let stop = Arc::new(AtomicBool::new(false));
    // every control frame must land in its own socket write, and the
    // stdin and signal threads both send them
    let write_client = Arc::new(Mutex::new(client.try_clone()?));

    spawn_signal_handler(Arc::clone(&stop), Arc::clone(&write_client))?;

    let pump_res = thread::scope(|s| -> anyhow::Result<()> {
        let stdin_h = s.spawn(|| stdin_to_sock(&stop, &write_client, disable_ctrl_x));
        let sock_h = s.spawn(|| sock_to_stdout(&stop, &mut client.stream));

        loop {
            if stop.load(Ordering::Relaxed) || stdin_h.is_finished() || sock_h.is_finished() {
                stop.store(true, Ordering::Relaxed);
                break;
            }
            thread::sleep(consts::JOIN_POLL_DUR);
        }

        match stdin_h.join() {
            Ok(v) => v.context("joining stdin pump")?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
        match sock_h.join() {
            Ok(v) => v.context("joining socket pump")?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
        Ok(())
    });

    // Restoration must happen on every path out of the pump loop,
    // including signal-driven cancellation.
    if let Err(e) = tty::set_nonblocking(0, false) {
        error!("error restoring blocking stdin: {:?}", e);
    }
    drop(raw_guard);
    reg.clear_current();

    println!("Detached from session {id}");
    pump_res
}

fn spawn_signal_handler(
    stop: Arc<AtomicBool>,
    write_client: Arc<Mutex<protocol::Client>>,
) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGWINCH, SIGINT, SIGTERM, SIGUSR1])
        .context("creating signal iterator")?;

    thread::spawn(move || {
        for signal in &mut signals {
            match signal {
                SIGWINCH => {
                    if let Ok(size) = tty::Size::query(0) {
                        let mut client = write_client.lock().unwrap();
                        if let Err(e) = client.send_resize(size.rows, size.cols) {
                            info!("sending resize frame: {:?}", e);
                        }
                    }
                }
                SIGUSR1 => {
                    // out-of-band detach from another invocation
                    info!("got SIGUSR1, detaching");
                    let mut client = write_client.lock().unwrap();
                    let _ = client.send_detach();
                    stop.store(true, Ordering::Relaxed);
                }
                _ => {
                    info!("got signal {}, shutting down", signal);
                    stop.store(true, Ordering::Relaxed);
                }
            }
        }
    });

    Ok(())
}

fn stdin_to_sock(
    stop: &AtomicBool,
    write_client: &Mutex<protocol::Client>,
    disable_ctrl_x: bool,
) -> anyhow::Result<()> {
    let mut stdin = io::stdin().lock();
    let mut buf = vec![0; consts::BUF_SIZE];
    let mut last_ping = Instant::now();

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        if last_ping.elapsed() >= consts::KEEPALIVE_DUR {
            let mut client = write_client.lock().unwrap();
            if let Err(e) = client.send_ping() {
                // the socket pump will notice the dead peer
                info!("sending keepalive: {:?}", e);
            }
            last_ping = Instant::now();
        }

        match stdin.read(&mut buf) {
            Ok(0) => {
                // stdin closed under us; the session stays attached
                thread::sleep(consts::PIPE_POLL_DUR);
            }
            Ok(1) if buf[0] == consts::DETACH_BYTE && !disable_ctrl_x => {
                info!("got detach byte");
                let mut client = write_client.lock().unwrap();
                let _ = client.send_detach();
                stop.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Ok(n) => {
                trace!("stdin->sock: read {} bytes", n);
                let mut client = write_client.lock().unwrap();
                client.send_input(&buf[..n]).context("forwarding stdin chunk")?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(consts::STDIN_POLL_DUR);
            }
            // a signal (notably SIGWINCH) interrupted the read
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading stdin"),
        }
    }
}

fn sock_to_stdout(stop: &AtomicBool, stream: &mut std::os::unix::net::UnixStream) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    let mut buf = vec![0; consts::BUF_SIZE];

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                info!("sock->stdout: supervisor closed the connection");
                stop.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Ok(n) => {
                let chunk = &buf[..n];
                if chunk == protocol::PONG {
                    // keepalive reply, not terminal output
                    trace!("sock->stdout: pong");
                    continue;
                }
                stdout.write_all(chunk).context("writing chunk to stdout")?;
                if let Err(e) = stdout.flush() {
                    // when flooded with output there is no need to
                    // force every last byte out immediately
                    if e.kind() != io::ErrorKind::WouldBlock {
                        return Err(e).context("flushing stdout");
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                info!("sock->stdout: read error: {:?}", e);
                stop.store(true, Ordering::Relaxed);
                return Ok(());
            }
        }
    }
}
