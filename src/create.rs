use std::{env, process, thread, time::Instant};

use anyhow::{anyhow, Context};
use tracing::info;

use super::{
    attach,
    config::Config,
    consts,
    error::SessError,
    registry,
    registry::Registry,
    tty,
};

/// Create a new session and attach to it: allocate an ID, spawn the
/// supervisor, wait for its socket to appear, then become a client.
pub fn run(reg: &Registry, config: &Config, disable_ctrl_x: bool) -> anyhow::Result<()> {
    if registry::in_session() {
        let current = registry::current_session_from_env().unwrap_or_default();
        return Err(SessError::InSession(registry::normalize_id(&current)).into());
    }

    // Hold the registry lock from allocation until the supervisor's
    // files exist, so a concurrent create can't be handed the same ID.
    let lock = reg.lock()?;
    let id = reg.alloc_next_id(&lock)?;

    let shell = resolve_shell(config);
    let size = if tty::stdin_is_tty() {
        tty::Size::query(0).unwrap_or_default()
    } else {
        tty::Size::default()
    };

    info!("creating session {} shell={} size={:?}", id, shell, size);

    let exe = env::current_exe().context("locating the sess binary")?;
    let mut cmd = process::Command::new(exe);
    if env::var(consts::DEBUG_ENV_VAR).as_deref() == Ok("1") {
        cmd.arg("--log-file")
            .arg(env::temp_dir().join(format!("sess-daemon-{id}.log")))
            .arg("-v");
    }
    cmd.arg("daemon")
        .arg(&id)
        .arg(reg.socket_path(&id))
        .arg(reg.meta_path(&id))
        .arg(&shell)
        .arg(size.rows.to_string())
        .arg(size.cols.to_string())
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        // the supervisor keeps stderr until it detaches, so startup
        // failures land on this terminal
        .stderr(process::Stdio::inherit());

    cmd.spawn().context("launching session supervisor")?;

    let sock = reg.socket_path(&id);
    let deadline = Instant::now() + consts::SOCKET_READY_TIMEOUT;
    while !sock.exists() {
        if Instant::now() >= deadline {
            return Err(anyhow!("supervisor for session {id} never came up"));
        }
        thread::sleep(consts::CONNECT_POLL_DUR);
    }
    drop(lock);

    println!("Created session {} at {}", id, registry::timestamp_now());
    attach::attach_to(reg, &id, disable_ctrl_x)
}

/// Config override, then $SHELL, then the passwd entry, then /bin/sh.
pub fn resolve_shell(config: &Config) -> String {
    if let Some(shell) = &config.shell {
        return shell.clone();
    }
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
        let shell = user.shell.to_string_lossy();
        if !shell.is_empty() {
            return shell.into_owned();
        }
    }
    String::from("/bin/sh")
}
