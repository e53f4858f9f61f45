//! TCP transport with in-place TLS upgrade and newline-delimited framing.
//!
//! The wire protocol is UTF-8 text (no byte-order mark), one JSON object per
//! line. The TLS capability exchange happens before the stream is split for
//! the read loop, because a `startTLS: true` answer swaps the plaintext
//! socket for an encrypted one — see [`read_probe_line`] for why that first
//! read must not buffer ahead.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tracing::{debug, trace};

use crate::error::{Result, SyncplayError};

/// Open the TCP connection. Refused/reset surfaces as [`SyncplayError::Io`].
pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    // One flush per line; Nagle only adds latency here.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Upgrade the plaintext socket to TLS with standard trust validation.
/// Validation failure aborts the connection attempt — there is no downgrade.
pub(crate) async fn upgrade_tls(stream: TcpStream, host: &str) -> Result<MaybeTlsStream> {
    let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
    let tls = connector.connect(host, stream).await?;
    debug!("TLS connection established");
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
}

/// Read exactly one line from the not-yet-upgraded socket.
///
/// Reads byte-at-a-time on purpose: a buffered reader could swallow bytes
/// past the newline, and those bytes would be lost if the stream is then
/// wrapped in TLS. The exchange is a single short line, so the cost is nil.
///
/// End-of-stream here means the server hung up mid-negotiation, which is a
/// distinct fatal error.
pub(crate) async fn read_probe_line(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(SyncplayError::HandshakeIncomplete);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    let line = String::from_utf8(line).map_err(|e| {
        SyncplayError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    trace!(%line, "server");
    Ok(line)
}

/// Write one line and flush immediately. Usable on the raw socket during the
/// handshake and on either half afterwards.
pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(%line, "client");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// A socket that may or may not have been upgraded to TLS.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Split the (possibly upgraded) stream into the loop's reader and the shared
/// writer.
pub(crate) fn split(stream: MaybeTlsStream) -> (MessageReader, MessageWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        MessageReader {
            inner: BufReader::new(read),
        },
        MessageWriter { inner: write },
    )
}

/// Line-oriented read side. Owned exclusively by the read loop.
pub(crate) struct MessageReader {
    inner: BufReader<ReadHalf<MaybeTlsStream>>,
}

impl MessageReader {
    /// Next line, or `Ok(None)` on a clean end-of-stream. Trailing CR/LF is
    /// stripped.
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.inner.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        trace!(line = %line, "server");
        Ok(Some(line))
    }
}

/// Line-oriented write side. Shared behind one lock by the public command
/// surface and the loop's reactive replies.
pub(crate) struct MessageWriter {
    inner: WriteHalf<MaybeTlsStream>,
}

impl MessageWriter {
    /// Write one line and flush immediately.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.inner, line).await
    }

    /// Shut down the write side of the socket.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
