use std::time;

/// Exported into the child shell by the supervisor; every process
/// running inside a session inherits it.
pub const SESSION_ENV_VAR: &str = "SESS_NUM";

/// When set to "1", foreground commands emit terse diagnostics on stderr.
pub const DEBUG_ENV_VAR: &str = "SESS_DEBUG";

/// The byte that detaches the client (Ctrl-X), unless the policy
/// disables it for the attachment.
pub const DETACH_BYTE: u8 = 0x18;

pub const BUF_SIZE: usize = 1024 * 16;

// Deadlines. Every blocking call in the system wakes up on one of
// these so cancellation is always observed.
pub const SOCK_READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);
pub const SOCK_WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(1);
pub const ACCEPT_POLL_DUR: time::Duration = time::Duration::from_millis(100);
pub const PIPE_POLL_DUR: time::Duration = time::Duration::from_millis(20);
pub const STDIN_POLL_DUR: time::Duration = time::Duration::from_millis(10);
pub const JOIN_POLL_DUR: time::Duration = time::Duration::from_millis(100);

pub const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const CONNECT_POLL_DUR: time::Duration = time::Duration::from_millis(50);
pub const GREETING_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const SOCKET_READY_TIMEOUT: time::Duration = time::Duration::from_secs(2);

pub const LOCK_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const LOCK_POLL_DUR: time::Duration = time::Duration::from_millis(50);

/// How long the shell gets to act on SIGTERM before SIGKILL.
pub const SHELL_TERM_TIMEOUT: time::Duration = time::Duration::from_secs(1);
pub const SHELL_TERM_POLL_DUR: time::Duration = time::Duration::from_millis(50);

/// Clients that have shown no activity for this long are swept by the
/// supervisor's monitor. The attached client pings often enough that
/// only dead peers ever hit the bound.
pub const CLIENT_IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(30);
pub const KEEPALIVE_DUR: time::Duration = time::Duration::from_secs(10);
pub const MONITOR_SWEEP_DUR: time::Duration = time::Duration::from_secs(5);
