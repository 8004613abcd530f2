//! Message channels and the single-threaded reactor for ganger workers.
//!
//! A [`MessageChannel`] layers a typed, bidirectional message stream over any
//! byte source/sink pair: a socket, a pipe pair, or the process's own
//! stdin/stdout. Two wire encodings are supported (see [`Encoding`]), both
//! carrying the same [`Message`] envelope. The [`Reactor`] drives everything
//! on one thread: sockets are registered as counted source tasks and the loop
//! runs until no source remains or it is stopped explicitly.

mod channel;
mod message;
mod reactor;

pub use channel::{AsyncIo, Encoding, MessageChannel, MessageReader, MessageWriter};
pub use message::Message;
pub use reactor::{Reactor, ReactorHandle};

/// Errors raised by channels and the reactor.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer closed its sending side; no further messages will arrive.
    #[error("channel closed by peer")]
    Closed,
    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        // A clean EOF and a mid-frame EOF are both send-side closure as far
        // as the receive loop is concerned.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
