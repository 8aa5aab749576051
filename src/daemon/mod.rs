use std::{
    fs,
    os::unix::fs::PermissionsExt,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::{anyhow, Context};
use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{close, dup2, setsid},
};
use tracing::info;

use crate::{
    registry::{self, Registry, SessionMeta},
    tty,
};

mod server;
mod shell;
mod signals;

/// The supervisor: invoked by the launcher as
/// `sess daemon <id> <socket> <meta> <shell> <rows> <cols>` and never
/// returns to the terminal. Runs until the shell exits or a terminate
/// signal arrives.
pub fn run(
    id: String,
    socket: PathBuf,
    meta_path: PathBuf,
    shell_path: String,
    rows: u16,
    cols: u16,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING SUPERVISOR ============================\n\n");

    let root = meta_path
        .parent()
        .ok_or(anyhow!("metadata path has no parent directory"))?;
    let reg = Registry::from_root(root).context("opening registry")?;

    // Startup failures from here on are reported on stderr (we have
    // not redirected to /dev/null yet) so the launcher sees them.
    let shell = shell::Shell::spawn(&id, &shell_path).context("spawning session shell")?;
    info!("s({}): shell child pid {}", id, shell.child_pid);

    let listener = match init_session(&reg, &id, &socket, &shell, &shell_path, rows, cols) {
        Ok(listener) => listener,
        Err(e) => {
            // unwind: the shell must not outlive a failed startup
            shell.terminate();
            let _ = fs::remove_file(reg.meta_path(&id));
            let _ = fs::remove_file(&socket);
            return Err(e);
        }
    };

    if let Err(e) = detach_from_terminal() {
        shell.terminate();
        let _ = fs::remove_file(reg.meta_path(&id));
        let _ = fs::remove_file(&socket);
        return Err(e);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (shell_exited_tx, shell_exited_rx) = crossbeam_channel::bounded(0);
    signals::Handler::new(shell.child_pid)
        .spawn(Arc::clone(&stop), shell_exited_tx)
        .context("spawning signal handler")?;

    let server = server::Server::new(id.clone(), shell, Arc::clone(&stop));
    let serve_res = server::Server::serve(&server, listener);

    info!("s({}): shutting down", id);
    let shell_already_exited = matches!(
        shell_exited_rx.try_recv(),
        Err(crossbeam_channel::TryRecvError::Disconnected)
    );
    if !shell_already_exited {
        server.shell.terminate();
    }

    let _ = fs::remove_file(&socket);
    let _ = fs::remove_file(reg.meta_path(&id));
    reg.clear_current_if(&id);

    serve_res
}

/// Ordered startup past the shell spawn: initial size, metadata (the
/// shell is running, so the file may exist now), then the listening
/// socket, whose presence is the readiness signal for clients.
fn init_session(
    reg: &Registry,
    id: &str,
    socket: &Path,
    shell: &shell::Shell,
    shell_path: &str,
    rows: u16,
    cols: u16,
) -> anyhow::Result<UnixListener> {
    if rows > 0 && cols > 0 {
        shell
            .set_size(&tty::Size { rows, cols })
            .context("applying initial window size")?;
    }

    let meta = SessionMeta {
        session_num: String::from(id),
        created_at: registry::timestamp_now(),
        pid: shell.child_pid,
        command: String::from(shell_path),
    };
    reg.write_meta(&meta).context("writing session metadata")?;

    // a stale file from a crashed predecessor would fail the bind
    let _ = fs::remove_file(socket);
    let listener = UnixListener::bind(socket).context("binding to session socket")?;
    fs::set_permissions(socket, fs::Permissions::from_mode(0o600))
        .context("setting session socket permissions")?;

    Ok(listener)
}

/// Cut ties with the invoking terminal: become a session leader (best
/// effort) and point our own stdio at the null device. Startup errors
/// must be reported before this runs.
fn detach_from_terminal() -> anyhow::Result<()> {
    if let Err(e) = setsid() {
        // already a session leader is fine
        info!("setsid: {:?}", e);
    }

    let devnull =
        open("/dev/null", OFlag::O_RDWR, Mode::empty()).context("opening /dev/null")?;
    for fd in 0..=2 {
        dup2(devnull, fd).context("redirecting stdio to /dev/null")?;
    }
    if devnull > 2 {
        close(devnull).context("closing /dev/null handle")?;
    }
    Ok(())
}
