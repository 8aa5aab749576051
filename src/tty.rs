use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::{anyhow, Context};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::termios::{self, SetArg, Termios},
    unistd::isatty,
};
use tracing::warn;

nix::ioctl_read_bad!(ioctl_get_winsize, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(ioctl_set_winsize, libc::TIOCSWINSZ, libc::winsize);

/// A terminal's dimensions in character cells.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// Ask the tty behind `fd` how big it currently is.
    pub fn query(fd: RawFd) -> anyhow::Result<Size> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // Saftey: ws lives on the stack for the duration of the call.
        unsafe {
            ioctl_get_winsize(fd, &mut ws).context("querying window size")?;
        }
        Ok(Size { rows: ws.ws_row, cols: ws.ws_col })
    }

    /// Resize the tty behind `fd` to these dimensions.
    pub fn apply(&self, fd: RawFd) -> anyhow::Result<()> {
        let ws = libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            ioctl_set_winsize(fd, &ws).context("applying window size")?;
        }
        Ok(())
    }
}

pub fn stdin_is_tty() -> bool {
    isatty(io::stdin().as_raw_fd()).unwrap_or(false)
}

/// Flip O_NONBLOCK on an already open descriptor.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> anyhow::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("fetching fd flags")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("setting fd flags")?;
    Ok(())
}

/// Put stdin's terminal into raw mode so every keystroke reaches the
/// session immediately; the shell's own tty on the pty slave is the
/// one that applies line discipline. Refuses to run without a
/// terminal. The returned guard undoes the change when dropped, which
/// covers every exit path out of an attachment.
pub fn enter_raw_mode() -> anyhow::Result<RawModeGuard> {
    let fd = io::stdin().as_raw_fd();
    if !isatty(fd).context("probing stdin")? {
        return Err(anyhow!("stdin is not a terminal"));
    }

    let saved = termios::tcgetattr(fd).context("reading terminal attributes")?;

    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(fd, SetArg::TCSANOW, &raw)
        .context("switching terminal to raw mode")?;

    Ok(RawModeGuard { fd, saved })
}

pub struct RawModeGuard {
    fd: RawFd,
    saved: Termios,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.saved) {
            warn!("could not restore terminal attributes: {:?}", e);
        }
    }
}
