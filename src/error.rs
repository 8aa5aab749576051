use thiserror::Error;

/// The error kinds that callers branch on. These ride inside anyhow
/// chains; use `downcast_ref::<SessError>()` where behavior depends on
/// the kind rather than the message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessError {
    #[error("session {0} not found")]
    NotFound(String),

    /// Metadata was present but the recorded shell pid is gone. The
    /// registry garbage-collects before reporting this.
    #[error("session {0} is dead")]
    SessionDead(String),

    #[error("session {0} already has a client attached")]
    AlreadyAttached(String),

    #[error("no active attachment")]
    NotInSession,

    #[error("Cannot create session from within existing session {0}")]
    InSession(String),

    #[error("session {0} is already dead")]
    AlreadyDead(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out {0}")]
    Timeout(&'static str),
}
