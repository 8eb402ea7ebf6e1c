//! The transport a peer session is driven over: a plain TCP or TLS-wrapped byte
//! stream framed with [`crate::wire::JsonLineCodec`], split into independent
//! read/write halves so the inbound and outbound driver tasks (distilled spec §4.C)
//! can each own one without sharing a lock.
//!
//! Grounded on `yuv_p2p::client::stream::Decoder`'s incremental-decode loop for the
//! framing half, and on the teacher's `reqwest` `rustls-tls` feature
//! (`jsonrpc/Cargo.toml`) for the TLS stack, generalized from an HTTP client's TLS to
//! a raw `tokio-rustls` stream since this transport isn't HTTP.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder as _, Encoder as _};

use hsync_types::peer::{PeerDescriptor, Protocol};

use crate::wire::JsonLineCodec;

/// Errors establishing or using a peer transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying socket could not be established.
    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    /// The TLS handshake failed.
    #[error("TLS handshake with {0} failed: {1}")]
    Tls(String, #[source] std::io::Error),
    /// A frame failed to encode/decode.
    #[error(transparent)]
    Wire(#[from] crate::wire::Error),
    /// The peer closed the connection.
    #[error("peer closed connection")]
    Closed,
}

/// The write half of a framed peer connection: owned by the outbound driver task.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame.
    async fn send(&mut self, value: Value) -> Result<(), Error>;
    /// Shut down the underlying connection.
    async fn close(&mut self);
}

/// The read half of a framed peer connection: owned by the inbound driver task.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame, or `Ok(None)` on clean remote closure.
    async fn recv(&mut self) -> Result<Option<Value>, Error>;
}

/// A freshly split connection, ready to be handed to the outbound/inbound driver
/// tasks (distilled spec §4.C).
pub struct Split {
    /// Owned by the outbound driver.
    pub writer: Box<dyn FrameWriter>,
    /// Owned by the inbound driver.
    pub reader: Box<dyn FrameReader>,
}

/// Dial `descriptor` over plain TCP or TLS as its protocol tag demands, returning the
/// connection already split into independent halves.
pub async fn connect(
    descriptor: &PeerDescriptor,
    tls_connector: Option<Arc<tokio_rustls::TlsConnector>>,
) -> Result<Split, Error> {
    let addr = (descriptor.host.as_str(), descriptor.port);
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::Connect(descriptor.to_string(), e))?;

    match descriptor.protocol {
        Protocol::Plain => {
            let (read, write) = tokio::io::split(stream);
            Ok(Split {
                writer: Box::new(Writer::new(write)),
                reader: Box::new(Reader::new(read)),
            })
        }
        Protocol::Tls => {
            let connector = tls_connector.ok_or_else(|| {
                Error::Tls(
                    descriptor.to_string(),
                    std::io::Error::new(std::io::ErrorKind::Other, "no TLS connector configured"),
                )
            })?;
            let server_name = rustls_pki_types::ServerName::try_from(descriptor.host.clone())
                .map_err(|e| {
                    Error::Tls(
                        descriptor.to_string(),
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                    )
                })?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::Tls(descriptor.to_string(), e))?;
            let (read, write) = tokio::io::split(tls_stream);
            Ok(Split {
                writer: Box::new(Writer::new(write)),
                reader: Box::new(Reader::new(read)),
            })
        }
    }
}

struct Writer<S> {
    io: WriteHalf<S>,
    codec: JsonLineCodec,
    buf: bytes::BytesMut,
}

impl<S: AsyncWrite + Unpin> Writer<S> {
    fn new(io: WriteHalf<S>) -> Self {
        Self {
            io,
            codec: JsonLineCodec::default(),
            buf: bytes::BytesMut::new(),
        }
    }
}

#[async_trait]
impl<S: AsyncWrite + Unpin + Send> FrameWriter for Writer<S> {
    async fn send(&mut self, value: Value) -> Result<(), Error> {
        self.buf.clear();
        self.codec.encode(value, &mut self.buf)?;
        self.io
            .write_all(&self.buf)
            .await
            .map_err(|e| Error::Wire(crate::wire::Error::Io(e)))?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

struct Reader<S> {
    io: ReadHalf<S>,
    codec: JsonLineCodec,
    buf: bytes::BytesMut,
}

impl<S: AsyncRead + Unpin> Reader<S> {
    fn new(io: ReadHalf<S>) -> Self {
        Self {
            io,
            codec: JsonLineCodec::default(),
            buf: bytes::BytesMut::with_capacity(4096),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + Unpin + Send> FrameReader for Reader<S> {
    async fn recv(&mut self) -> Result<Option<Value>, Error> {
        loop {
            if let Some(value) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(value));
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .io
                .read(&mut chunk)
                .await
                .map_err(|e| Error::Wire(crate::wire::Error::Io(e)))?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// A split in-memory transport pair for tests: two ends of a [`tokio::io::duplex`]
/// pipe, each wrapped and split as [`connect`] would, so supervisor/session logic can
/// be exercised without a real socket.
pub fn test_pair() -> (Split, Split) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        Split {
            writer: Box::new(Writer::new(a_write)),
            reader: Box::new(Reader::new(a_read)),
        },
        Split {
            writer: Box::new(Writer::new(b_write)),
            reader: Box::new(Reader::new(b_read)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn split_pair_roundtrips_over_duplex_pipe() {
        let (mut client, mut server) = test_pair();

        client.writer.send(json!({"id": 1, "method": "server.version"})).await.unwrap();
        let received = server.reader.recv().await.unwrap().unwrap();
        assert_eq!(received["method"], "server.version");

        server.writer.send(json!({"id": 1, "result": "1.4"})).await.unwrap();
        let received = client.reader.recv().await.unwrap().unwrap();
        assert_eq!(received["result"], "1.4");
    }

    #[tokio::test]
    async fn recv_returns_none_on_clean_close() {
        let (client, mut server) = test_pair();
        client.writer.close().await;
        drop(client.writer);
        assert!(server.reader.recv().await.unwrap().is_none());
    }
}
