use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::info;

use super::{error::SessError, registry::Registry};

/// Out-of-band detach: resolve the attached client through the
/// registry and deliver SIGUSR1; its handler runs the normal detach
/// path. A stale pointer gets cleared instead.
pub fn run(reg: &Registry) -> anyhow::Result<()> {
    let att = match reg.get_current()? {
        Some(att) => att,
        None => return Err(SessError::NotInSession.into()),
    };

    if att.pid <= 0 {
        // legacy record carrying no client pid; nothing to signal
        reg.clear_current();
        return Err(anyhow!(
            "no client pid recorded for session {}; cleared the stale attachment",
            att.number
        ));
    }

    match signal::kill(Pid::from_raw(att.pid), Signal::SIGUSR1) {
        Ok(()) => {
            info!("signaled client {} of session {}", att.pid, att.number);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            reg.clear_current();
            Err(anyhow!(
                "client for session {} is gone; cleared the stale attachment",
                att.number
            ))
        }
        Err(e) => Err(e).context("signaling the attached client"),
    }
}
