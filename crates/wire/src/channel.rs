//! Typed message channels over arbitrary byte streams.
//!
//! Wire formats:
//! ```text
//! framed:  [length: u32 BE][payload: length bytes of JSON envelope]
//! lines:   one JSON value per newline-terminated line (generic encoding)
//! ```
//! The framed form carries the native tagged envelope and is the default for
//! channels between ganger peers. The lines form is for peers that cannot
//! speak the native envelope: admin messages travel as single-key maps and
//! everything else is passed through as-is.

use std::str::FromStr;

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, Result, WireError};

/// Maximum framed payload size: 16MB
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

impl std::fmt::Debug for dyn AsyncIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn AsyncIo")
    }
}

trait ReadIo: AsyncRead + Unpin + Send {}
impl<T> ReadIo for T where T: AsyncRead + Unpin + Send {}

trait WriteIo: AsyncWrite + Unpin + Send {}
impl<T> WriteIo for T where T: AsyncWrite + Unpin + Send {}

/// Which wire representation a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Length-prefixed JSON of the native tagged envelope.
    #[default]
    Framed,
    /// Newline-delimited JSON of generic values.
    Lines,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Framed => "framed",
            Encoding::Lines => "lines",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "framed" => Ok(Encoding::Framed),
            "lines" => Ok(Encoding::Lines),
            other => Err(format!("unknown channel encoding: {other:?}")),
        }
    }
}

/// Receiving half of a [`MessageChannel`].
pub struct MessageReader {
    encoding: Encoding,
    io: Box<dyn ReadIo>,
    buf: BytesMut,
}

impl MessageReader {
    /// Receive one message; [`WireError::Closed`] signals peer shutdown.
    ///
    /// Cancel-safe: incoming bytes accumulate in an internal buffer and a
    /// message leaves it only once complete, so dropping an in-flight `recv`
    /// future never tears or loses a message.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.decode_buffered()? {
                return Ok(message);
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(WireError::Closed);
            }
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Message>> {
        match self.encoding {
            Encoding::Framed => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len =
                    u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                        as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(WireError::FrameTooLarge(len, MAX_FRAME_SIZE));
                }
                if self.buf.len() < 4 + len {
                    self.buf.reserve(4 + len - self.buf.len());
                    return Ok(None);
                }
                self.buf.advance(4);
                let body = self.buf.split_to(len);
                Ok(Some(serde_json::from_slice(&body)?))
            }
            Encoding::Lines => loop {
                let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
                    return Ok(None);
                };
                let line = self.buf.split_to(end + 1);
                let line = &line[..line.len() - 1];
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                let value: Value = serde_json::from_slice(line)?;
                return Ok(Some(Message::from_generic(value)));
            },
        }
    }
}

/// Sending half of a [`MessageChannel`].
pub struct MessageWriter {
    encoding: Encoding,
    inner: Box<dyn WriteIo>,
}

impl MessageWriter {
    pub async fn send(&mut self, message: Message) -> Result<()> {
        let bytes = match self.encoding {
            Encoding::Framed => serde_json::to_vec(&message)?,
            Encoding::Lines => serde_json::to_vec(&message.into_generic())?,
        };
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(bytes.len(), MAX_FRAME_SIZE));
        }
        match self.encoding {
            Encoding::Framed => {
                self.inner.write_u32(bytes.len() as u32).await?;
                self.inner.write_all(&bytes).await?;
            }
            Encoding::Lines => {
                self.inner.write_all(&bytes).await?;
                self.inner.write_all(b"\n").await?;
            }
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// A bidirectional typed message stream over a byte source/sink.
pub struct MessageChannel {
    reader: MessageReader,
    writer: MessageWriter,
}

impl MessageChannel {
    /// Wrap a single duplex stream (socket, duplex pipe).
    pub fn new<T: AsyncIo + 'static>(io: T, encoding: Encoding) -> Self {
        let (read, write) = tokio::io::split(io);
        Self::from_pair(read, write, encoding)
    }

    /// Wrap a separate source and sink (pipe pair, stdin/stdout).
    pub fn from_pair<R, W>(read: R, write: W, encoding: Encoding) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: MessageReader {
                encoding,
                io: Box::new(read),
                buf: BytesMut::new(),
            },
            writer: MessageWriter {
                encoding,
                inner: Box::new(write),
            },
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.reader.encoding
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Message> {
        self.reader.recv().await
    }

    /// Split into independently owned halves, so receiving and sending can
    /// live on different tasks.
    pub fn into_split(self) -> (MessageReader, MessageWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = MessageChannel::new(client, Encoding::Framed);
        let mut b = MessageChannel::new(server, Encoding::Framed);

        a.send(Message::data(serde_json::json!({ "n": 1 })))
            .await
            .expect("send");
        let got = b.recv().await.expect("recv");
        assert_eq!(got, Message::data(serde_json::json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_lines_wire_form_is_generic() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = MessageChannel::new(client, Encoding::Lines);
        a.send(Message::stop(Some("s".into()))).await.expect("send");
        drop(a);

        // A peer speaking plain newline-delimited JSON sees the single-key
        // admin map, not the tagged envelope.
        let mut raw = String::new();
        let mut lines = BufReader::new(server);
        tokio::io::AsyncBufReadExt::read_line(&mut lines, &mut raw)
            .await
            .expect("read line");
        assert_eq!(raw.trim_end(), r#"{"_stop_":"s"}"#);
    }

    #[tokio::test]
    async fn test_lines_admin_and_data() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = MessageChannel::new(client, Encoding::Lines);
        let mut b = MessageChannel::new(server, Encoding::Lines);

        a.send(Message::query(Some("c".into()))).await.expect("send");
        a.send(Message::data(serde_json::json!([1, 2])))
            .await
            .expect("send");

        assert_eq!(b.recv().await.expect("recv"), Message::query(Some("c".into())));
        assert_eq!(
            b.recv().await.expect("recv"),
            Message::data(serde_json::json!([1, 2]))
        );
    }

    #[tokio::test]
    async fn test_closed_peer_reports_underflow() {
        let (client, server) = tokio::io::duplex(64);
        let mut b = MessageChannel::new(server, Encoding::Framed);
        drop(client);

        match b.recv().await {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_recv_keeps_the_stream_in_sync() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut b = MessageChannel::new(server, Encoding::Framed);

        let message = Message::data(serde_json::json!({ "n": 7 }));
        let body = serde_json::to_vec(&message).expect("encode");
        client
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .expect("write prefix");
        client.write_all(&body[..3]).await.expect("write start");

        // Abandon a receive mid-frame, as a readiness-select would.
        let partial = tokio::time::timeout(std::time::Duration::from_millis(20), b.recv()).await;
        assert!(partial.is_err());

        client.write_all(&body[3..]).await.expect("write rest");
        assert_eq!(b.recv().await.expect("recv"), message);
    }
}
