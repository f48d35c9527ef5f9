//! Framed socket: line-delimited read/write over TCP or TLS with a bounded
//! outbound queue.
//!
//! Reads produce one newline-delimited line at a time with trailing CR/LF
//! stripped. Writes take a single fully-formed IRC line; a background
//! writer task serializes concurrent writers. Close is idempotent. A
//! `final_data` slot lets a caller enqueue one last line to be flushed
//! before the socket actually closes (used to deliver `464 Invalid
//! password` before disconnecting a failed PASS attempt).

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Default bound on total bytes queued for a single socket's writer.
pub const DEFAULT_SEND_QUEUE_BYTES: usize = 32 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The outbound queue exceeded its byte budget; connection was dropped.
    #[error("send queue exceeded {0} bytes")]
    QueueOverflow(usize),
    /// The socket was already closed.
    #[error("socket closed")]
    Closed,
}

/// Any stream type a [`FramedSocket`] can wrap.
enum AnyStream {
    Tcp(TcpStream),
    TlsServer(ServerTlsStream<TcpStream>),
    TlsClient(ClientTlsStream<TcpStream>),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::TlsServer(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::TlsClient(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::TlsServer(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::TlsClient(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AnyStream::TlsServer(s) => Pin::new(s).poll_flush(cx),
            AnyStream::TlsClient(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::TlsServer(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::TlsClient(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Codec that splits on `\n` and strips a trailing `\r`; encodes by
/// appending `\r\n`.
struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(pos) = src.iter().position(|&b| b == b'\n') {
            let mut line = src.split_to(pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let s = String::from_utf8_lossy(&line).into_owned();
            Ok(Some(s))
        } else {
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// A bidirectional, line-delimited socket wrapper with a bounded send queue.
pub struct FramedSocket {
    read_half: Mutex<futures_util::stream::SplitStream<Framed<AnyStream, LineCodec>>>,
    write_tx: mpsc::UnboundedSender<String>,
    queued_bytes: Arc<AtomicUsize>,
    capacity: usize,
    closed: Arc<AtomicBool>,
    final_data: Mutex<Option<String>>,
}

impl FramedSocket {
    fn from_stream(stream: AnyStream, capacity: usize) -> Self {
        let framed = Framed::new(stream, LineCodec);
        let (mut sink, stream) = framed.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let qb = queued_bytes.clone();
        let cl = closed.clone();
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                qb.fetch_sub(line.len().min(qb.load(Ordering::Relaxed)), Ordering::Relaxed);
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            cl.store(true, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        FramedSocket {
            read_half: Mutex::new(stream),
            write_tx,
            queued_bytes,
            capacity,
            closed,
            final_data: Mutex::new(None),
        }
    }

    /// Wrap a plain TCP connection.
    #[must_use]
    pub fn tcp(stream: TcpStream) -> Self {
        Self::from_stream(AnyStream::Tcp(stream), DEFAULT_SEND_QUEUE_BYTES)
    }

    /// Wrap a server-side TLS connection (accepted listener).
    #[must_use]
    pub fn tls_server(stream: ServerTlsStream<TcpStream>) -> Self {
        Self::from_stream(AnyStream::TlsServer(stream), DEFAULT_SEND_QUEUE_BYTES)
    }

    /// Wrap a client-side TLS connection (outbound upstream dial).
    #[must_use]
    pub fn tls_client(stream: ClientTlsStream<TcpStream>) -> Self {
        Self::from_stream(AnyStream::TlsClient(stream), DEFAULT_SEND_QUEUE_BYTES)
    }

    /// Read one line. Returns `Ok(None)` on clean EOF.
    pub async fn recv_line(&self) -> io::Result<Option<String>> {
        let mut read_half = self.read_half.lock().await;
        match read_half.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Enqueue a line for writing. Closes the socket and returns
    /// [`TransportError::QueueOverflow`] if the bound would be exceeded.
    pub fn send_line(&self, line: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let projected = self.queued_bytes.fetch_add(line.len(), Ordering::Relaxed) + line.len();
        if projected > self.capacity {
            self.close();
            return Err(TransportError::QueueOverflow(self.capacity));
        }
        let _ = self.write_tx.send(line);
        Ok(())
    }

    /// Stash one last line to be sent immediately before [`Self::close`].
    pub async fn set_final_data(&self, line: String) {
        *self.final_data.lock().await = Some(line);
    }

    /// Idempotently close the socket, flushing any `final_data` line first.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(line) = self.final_data.lock().await.take() {
            let _ = self.write_tx.send(line);
        }
        // Dropping the sender lets the writer task drain and exit.
    }

    /// Whether the socket has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_codec_strips_crlf() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"PING :abc\r\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "PING :abc");
    }

    #[test]
    fn line_codec_encodes_with_crlf() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        codec.encode("PONG :x".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG :x\r\n");
    }
}
