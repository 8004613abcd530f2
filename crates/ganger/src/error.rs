//! Error kinds for worker provisioning and supervision.
//!
//! The kinds are deliberately coarse: configuration and logic errors are
//! always fatal, connect errors are retried only inside the connect-or-launch
//! protocol, and bind errors are retried exactly once for the stale unix
//! socket file case. Everything else surfaces to the caller unchanged.

use std::io;

use ganger_wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Missing or contradictory configuration; never retried.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Bad call sequence or a call the current state forbids; never retried.
    #[error("{0}")]
    Logic(String),
    /// Client socket connection failure.
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Server socket bind or listen failure.
    #[error("could not bind or listen on {address}: {source}")]
    BindOrListen {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Unexpected failure at run time (kill switch denial, missing external
    /// tool, unwritable state file).
    #[error("{0}")]
    Runtime(String),
    /// Bad lookahead-buffer index; programmer error.
    #[error("message index {index} out of range, the lookahead queue holds {len} messages")]
    OutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    /// True if the failure is a refused/absent connection, the only class
    /// the connect-or-launch protocol may swallow and retry.
    pub fn is_connect(&self) -> bool {
        matches!(self, WorkerError::Connect { .. })
    }
}
