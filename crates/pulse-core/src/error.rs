//! Error taxonomy shared by every stage of a run.
//!
//! Errors are classified by *kind* rather than by origin so the binary can map
//! any failure to a stable process exit code. Steady-state loops do not bubble
//! transient socket conditions up through here: `EAGAIN`, `EINTR`, and peer
//! resets are handled inline by the send/receive paths (see `registry` and
//! `client`/`server`); only conditions that end the run become a `PulseError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PulseError>;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Malformed input: feedfile line, playback record, or wire header.
    #[error("incorrect format: {0}")]
    Incorrect(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("does not exist: {0}")]
    NotExist(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An internal invariant was violated; the run cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("socket: {context}: {source}")]
    Socket {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout: {0}")]
    Timeout(String),
}

impl PulseError {
    /// Shorthand for wrapping the current `errno` under a socket context.
    pub fn socket(context: impl Into<String>) -> Self {
        PulseError::Socket {
            context: context.into(),
            source: std::io::Error::last_os_error(),
        }
    }

    pub fn socket_err(context: impl Into<String>, source: std::io::Error) -> Self {
        PulseError::Socket { context: context.into(), source }
    }

    /// Process exit code for this kind. Success is 0; signal-initiated
    /// termination also exits 0 after the summary is printed.
    pub fn exit_code(&self) -> i32 {
        match self {
            PulseError::BadArgument(_) => 1,
            PulseError::Incorrect(_) => 2,
            PulseError::Unsupported(_) => 3,
            PulseError::NotExist(_) => 4,
            PulseError::OutOfMemory(_) => 5,
            PulseError::Fatal(_) => 6,
            PulseError::Socket { .. } => 7,
            PulseError::Timeout(_) => 8,
        }
    }
}
