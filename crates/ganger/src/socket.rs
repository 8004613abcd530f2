//! Stream-socket construction with typed failures.
//!
//! Servers and clients are built from textual addresses (`unix://...` or
//! `tcp://host:port`). Failure never leaks a half-open socket: binding
//! converts into [`WorkerError::BindOrListen`], connecting into
//! [`WorkerError::Connect`], and the caller gets nothing else.
//!
//! Binding a unix address can fail because a previous owner died without
//! unlinking its socket file. That case is disambiguated with a short
//! diagnostic connect: if somebody answers, the address is really in use and
//! the original bind error stands; if nobody answers, the file is stale, it
//! is unlinked, and the bind is retried exactly once.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::debug;

use ganger_wire::AsyncIo;

use crate::address::SocketAddress;
use crate::error::{Result, WorkerError};

/// Connect timeout applied when the caller does not override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout of the diagnostic connect in the stale-socket-file recovery.
const STALE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_BACKLOG: u32 = 1024;

/// Optional socket tuning, applied where the transport supports it
/// (TCP only; unix sockets ignore it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketContext {
    pub backlog: Option<u32>,
    pub nodelay: Option<bool>,
}

/// A bound, listening server socket.
#[derive(Debug)]
pub enum ServerSocket {
    Unix {
        listener: UnixListener,
        address: SocketAddress,
    },
    Tcp {
        listener: TcpListener,
        address: SocketAddress,
        nodelay: Option<bool>,
    },
}

impl ServerSocket {
    pub fn address(&self) -> &SocketAddress {
        match self {
            ServerSocket::Unix { address, .. } | ServerSocket::Tcp { address, .. } => address,
        }
    }

    /// Accepts one connection, returning the stream and the peer's textual
    /// address where the transport has one.
    pub async fn accept(&self) -> Result<(Box<dyn AsyncIo>, Option<String>)> {
        match self {
            ServerSocket::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
            ServerSocket::Tcp {
                listener, nodelay, ..
            } => {
                let (stream, peer) = listener.accept().await?;
                if let Some(nodelay) = nodelay {
                    stream.set_nodelay(*nodelay)?;
                }
                Ok((Box::new(stream), Some(peer.to_string())))
            }
        }
    }

}

/// Binds and listens on `address`, recovering once from a stale unix socket
/// file as described in the module docs.
pub async fn create_server_socket(
    address: &SocketAddress,
    context: Option<&SocketContext>,
) -> Result<ServerSocket> {
    let original = match bind_listener(address, context).await {
        Ok(socket) => return Ok(socket),
        Err(err) => err,
    };
    let Some(socket_file) = address.socket_file() else {
        return Err(original);
    };
    match create_client_socket(address, Some(STALE_PROBE_TIMEOUT), context).await {
        Ok(probe) => {
            // Somebody answered; the address is really in use.
            drop(probe);
            Err(original)
        }
        Err(_) => {
            debug!(file = %socket_file.display(), "removing stale socket file");
            if let Err(err) = tokio::fs::remove_file(&socket_file).await {
                debug!(%err, "could not remove stale socket file");
            }
            bind_listener(address, context).await
        }
    }
}

async fn bind_listener(
    address: &SocketAddress,
    context: Option<&SocketContext>,
) -> Result<ServerSocket> {
    let bind_error = |source: io::Error| WorkerError::BindOrListen {
        address: address.to_string(),
        source,
    };
    if let Some(path) = address.socket_file() {
        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        return Ok(ServerSocket::Unix {
            listener,
            address: address.clone(),
        });
    }
    let backlog = context
        .and_then(|context| context.backlog)
        .unwrap_or(DEFAULT_BACKLOG);
    let targets = tokio::net::lookup_host(address.strip_scheme())
        .await
        .map_err(bind_error)?;
    let mut last = None;
    for target in targets {
        match bind_tcp(target, backlog) {
            Ok(listener) => {
                return Ok(ServerSocket::Tcp {
                    listener,
                    address: address.clone(),
                    nodelay: context.and_then(|context| context.nodelay),
                });
            }
            Err(err) => last = Some(err),
        }
    }
    Err(bind_error(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    })))
}

fn bind_tcp(target: std::net::SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(target)?;
    socket.listen(backlog)
}

/// Connects to `address` within `timeout` (default
/// [`DEFAULT_CONNECT_TIMEOUT`]).
pub async fn create_client_socket(
    address: &SocketAddress,
    timeout: Option<Duration>,
    context: Option<&SocketContext>,
) -> Result<Box<dyn AsyncIo>> {
    let connect_error = |source: io::Error| WorkerError::Connect {
        address: address.to_string(),
        source,
    };
    let limit = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let stream = tokio::time::timeout(limit, connect_stream(address, context))
        .await
        .map_err(|_| {
            connect_error(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection attempt timed out",
            ))
        })?
        .map_err(connect_error)?;
    Ok(stream)
}

async fn connect_stream(
    address: &SocketAddress,
    context: Option<&SocketContext>,
) -> io::Result<Box<dyn AsyncIo>> {
    if let Some(path) = address.socket_file() {
        let stream = UnixStream::connect(&path).await?;
        return Ok(Box::new(stream));
    }
    let stream = TcpStream::connect(address.strip_scheme()).await?;
    if let Some(nodelay) = context.and_then(|context| context.nodelay) {
        stream.set_nodelay(nodelay)?;
    }
    Ok(Box::new(stream))
}
