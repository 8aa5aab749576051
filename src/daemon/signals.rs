use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use nix::{
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use signal_hook::{
    consts::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::info;

/// Translates process signals into the supervisor's stop flag.
///
/// SIGCHLD gets a nonblocking reap of the shell child; once the shell
/// is observed dead the `shell_exited` sender is dropped, which closes
/// the channel for anyone holding the receiver. SIGTERM and SIGINT
/// just close the latch. The latch is close-once; later signals are
/// no-ops.
pub struct Handler {
    shell_pid: i32,
}

impl Handler {
    pub fn new(shell_pid: i32) -> Self {
        Handler { shell_pid }
    }

    pub fn spawn(
        self,
        stop: Arc<AtomicBool>,
        shell_exited: crossbeam_channel::Sender<()>,
    ) -> anyhow::Result<()> {
        let mut signals =
            Signals::new([SIGCHLD, SIGTERM, SIGINT]).context("creating signal iterator")?;

        thread::spawn(move || {
            // Take ownership of the sender so it gets dropped when
            // this thread exits, closing the channel.
            let _tx = shell_exited;

            for signal in &mut signals {
                match signal {
                    SIGCHLD => {
                        match waitpid(
                            Pid::from_raw(self.shell_pid),
                            Some(WaitPidFlag::WNOHANG),
                        ) {
                            Ok(WaitStatus::StillAlive) => continue,
                            Ok(status) => {
                                info!("reaped shell child: {:?}", status);
                                stop.store(true, Ordering::Relaxed);
                                return;
                            }
                            Err(e) => {
                                info!("waiting on shell child: {:?}", e);
                                stop.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                    _ => {
                        info!("got terminate signal {}, shutting down", signal);
                        // Close-once: storing true again on a later
                        // signal is a no-op. Keep looping so the
                        // sender stays alive; dropping it is reserved
                        // for an observed shell exit.
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            }
        });

        Ok(())
    }
}
