use std::{
    os::unix::io::RawFd,
    os::unix::process::CommandExt,
    path::Path,
    process, thread,
    time::Instant,
};

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::Pid,
};
use tracing::info;

use crate::{consts, tty};

/// The supervised shell: a pty pair with the shell child running on
/// the slave side. Exclusively owned by the supervisor process; the
/// pty master never leaves it.
pub struct Shell {
    fork: shpool_pty::fork::Fork,
    pub child_pid: i32,
}

impl Shell {
    /// Open a pty pair and fork-exec the shell bound to the slave.
    /// The child gets a fresh session with the slave as its
    /// controlling terminal and sees `SESS_NUM=<id>` in its
    /// environment. The master side is left nonblocking.
    pub fn spawn(session_id: &str, shell: &str) -> anyhow::Result<Shell> {
        // Assemble the command before forking; after the fork the
        // child's stdio is already bound to the pty slave, so plain
        // inherit is what we want.
        let mut cmd = process::Command::new(shell);
        cmd.stdin(process::Stdio::inherit())
            .stdout(process::Stdio::inherit())
            .stderr(process::Stdio::inherit())
            .env(consts::SESSION_ENV_VAR, session_id);

        // A leading "-" on arg0 marks a login shell (the convention
        // sshd follows), so rc files get sourced as on a fresh login.
        let basename = Path::new(shell)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("shell path {shell:?} has no usable basename"))?;
        cmd.arg0(format!("-{basename}"));

        let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
        if fork.is_child().is_ok() {
            // don't leak stray descriptors into the user's shell
            for fd in 3..256 {
                let _ = nix::unistd::close(fd);
            }
            let err = cmd.exec();
            eprintln!("exec {shell}: {err}");
            std::process::exit(1);
        }

        let child_pid = fork.child_pid().ok_or(anyhow!("missing shell child pid"))?;
        let shell = Shell { fork, child_pid };

        tty::set_nonblocking(shell.master_fd()?, true)
            .context("setting pty master nonblocking")?;

        Ok(shell)
    }

    /// A fresh handle onto the master side for reading or writing.
    pub fn master(&self) -> anyhow::Result<shpool_pty::fork::Master> {
        self.fork.is_parent().context("internal error: executing in child fork")
    }

    pub fn master_fd(&self) -> anyhow::Result<RawFd> {
        let master = self.master()?;
        master.raw_fd().ok_or(anyhow!("no pty master fd"))
    }

    pub fn set_size(&self, size: &tty::Size) -> anyhow::Result<()> {
        size.apply(self.master_fd()?)
    }

    /// Deliver SIGWINCH to the shell's process group so full-screen
    /// programs repaint after a resize.
    pub fn signal_winch(&self) -> anyhow::Result<()> {
        signal::killpg(Pid::from_raw(self.child_pid), Signal::SIGWINCH)
            .context("signaling shell process group")
    }

    /// SIGTERM the shell, give it up to a second, then SIGKILL. Safe
    /// to call after the shell has already been reaped.
    pub fn terminate(&self) {
        match signal::kill(Pid::from_raw(self.child_pid), Signal::SIGTERM) {
            Err(Errno::ESRCH) => return,
            Err(e) => {
                info!("error terminating shell: {:?}", e);
                return;
            }
            Ok(()) => {}
        }

        let deadline = Instant::now() + consts::SHELL_TERM_TIMEOUT;
        loop {
            match waitpid(Pid::from_raw(self.child_pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        info!("shell ignored SIGTERM, sending SIGKILL");
                        let _ = signal::kill(Pid::from_raw(self.child_pid), Signal::SIGKILL);
                        // reap the kill so we don't leave a zombie behind
                        let _ = waitpid(Pid::from_raw(self.child_pid), None);
                        return;
                    }
                    thread::sleep(consts::SHELL_TERM_POLL_DUR);
                }
                // exited, or the signal handler thread already reaped it
                _ => return,
            }
        }
    }
}
